//! The gRPC surface of the node: a resource service exposing the store to
//! operators, and the transparent router that forwards calls from external
//! clients to the right backend.

pub mod router;
pub mod server;
pub mod tls;

pub use server::ResourceServer;
