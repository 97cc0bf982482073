//! The transparent gRPC proxy: accepts calls on the node's public port and
//! local socket and forwards raw frames to a local or remote backend
//! without decoding the payload.

mod backend;
mod detector;
mod proxy;

pub use detector::StreamingDetector;
pub use proxy::{serve_tls, serve_unix, ProxyBody, Router, NODES_HEADER};
