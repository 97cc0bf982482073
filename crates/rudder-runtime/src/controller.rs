use async_trait::async_trait;

use crate::handle::ControllerContext;

/// How a dependency influences controller scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// Wake the controller on any change to a matching resource.
    Weak,
    /// Like `Weak`, and additionally the controller participates in the
    /// finalizer lifecycle of the input: it must get a chance to tear down
    /// its outputs before a matching resource can be destroyed.
    Hard,
    /// Wake only when a matching resource becomes destroyable (tearing down
    /// with no finalizers left).
    DestroyReady,
}

/// One declared controller input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub namespace: String,
    pub ty: String,
    pub id: Option<String>,
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn weak(namespace: impl Into<String>, ty: impl Into<String>) -> Self {
        Dependency {
            namespace: namespace.into(),
            ty: ty.into(),
            id: None,
            kind: DependencyKind::Weak,
        }
    }

    pub fn hard(namespace: impl Into<String>, ty: impl Into<String>) -> Self {
        Dependency {
            namespace: namespace.into(),
            ty: ty.into(),
            id: None,
            kind: DependencyKind::Hard,
        }
    }

    pub fn destroy_ready(namespace: impl Into<String>, ty: impl Into<String>) -> Self {
        Dependency {
            namespace: namespace.into(),
            ty: ty.into(),
            id: None,
            kind: DependencyKind::DestroyReady,
        }
    }

    /// Restricts the dependency to a single resource id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A long-running reconciler.
///
/// Each controller is the sole writer of one (namespace, type) pair, its
/// managed output, and declares the inputs it reads by calling
/// [`ControllerContext::update_dependencies`] once at the top of
/// [`Controller::run`]. The run loop is expected to block on
/// [`ControllerContext::event`] and reconcile the full desired state on each
/// wakeup, returning only on shutdown (`Ok`) or on an error the runtime
/// should restart it for.
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// Unique name of the controller, used for logging and registration.
    fn name(&self) -> &'static str;

    /// The single (namespace, type) pair this controller is allowed to write.
    fn outputs(&self) -> (&str, &str);

    /// The reconciliation loop.
    async fn run(&self, ctx: &mut ControllerContext) -> anyhow::Result<()>;
}
