//! The controller runtime: a scheduler that owns a set of reconciling
//! controllers and wakes each one whenever one of its declared inputs
//! changes in the resource store.
//!
//! Controllers are level-triggered: a wakeup carries no payload, it only
//! means "something you depend on changed, reconcile the full desired
//! state". Wakeups arriving while a controller is busy coalesce into a
//! single pending notification.

mod backoff;
mod controller;
mod handle;
mod runtime;

pub use backoff::RestartBackoff;
pub use controller::{Controller, Dependency, DependencyKind};
pub use handle::ControllerContext;
pub use runtime::Runtime;
