//! The resource store backing the rudder node runtime.
//!
//! Everything the node knows about itself is kept here as a [`Resource`]: an
//! immutable spec payload wrapped in [`Metadata`] carrying a namespace, type,
//! id, monotonic version, lifecycle phase and finalizers. The [`State`] store
//! keeps resources in memory, serializes all mutations, and lets interested
//! parties [`State::watch`] a set of resources for changes.

pub mod constants;
mod error;
pub mod registry;
mod resource;
pub mod resources;
mod spec;
mod state;

pub use error::Error;
pub use resource::{Finalizers, Metadata, Phase, Query, Resource, Version};
pub use spec::Spec;
pub use state::{Event, EventKind, State};
