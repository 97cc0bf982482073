use rudder_state::{Error, Event, Phase, Query, Resource, State};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::controller::{Dependency, DependencyKind};

/// The narrowed store handle a controller runs against.
///
/// Reads pass straight through to the store; writes (`modify`, `teardown`,
/// `destroy`) are checked against the controller's declared output so no
/// controller can scribble over another one's resources. The context also
/// owns the controller's coalesced wakeup channel.
pub struct ControllerContext {
    name: &'static str,
    output: (String, String),
    state: State,
    shutdown: CancellationToken,
    wake_tx: watch::Sender<u64>,
    wake_rx: watch::Receiver<u64>,
    dependencies_installed: bool,
}

impl ControllerContext {
    pub(crate) fn new(
        name: &'static str,
        output: (String, String),
        state: State,
        shutdown: CancellationToken,
    ) -> Self {
        let (wake_tx, wake_rx) = watch::channel(0);

        ControllerContext {
            name,
            output,
            state,
            shutdown,
            wake_tx,
            wake_rx,
            dependencies_installed: false,
        }
    }

    /// Token fired when the runtime shuts down. Controllers select on this
    /// next to [`ControllerContext::event`] and return promptly when it fires.
    pub fn shutdown(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Declares the controller's input set and starts the watches feeding its
    /// wakeup channel. Called once at the top of `run`; an initial wakeup is
    /// queued so the first reconciliation happens even with an empty store.
    pub async fn update_dependencies(
        &mut self,
        dependencies: Vec<Dependency>,
    ) -> Result<(), Error> {
        // A restarted controller gets a fresh context, so this only guards
        // against a controller calling twice within one run.
        if self.dependencies_installed {
            return Ok(());
        }
        self.dependencies_installed = true;

        for dependency in dependencies {
            let query = match &dependency.id {
                Some(id) => Query::exact(&dependency.namespace, &dependency.ty, id),
                None => Query::kind(&dependency.namespace, &dependency.ty),
            };

            self.spawn_watch(query, dependency.kind).await?;
        }

        // The controller owns its outputs' teardown, so destroy-readiness of
        // an output must wake it as well.
        let (namespace, ty) = self.output.clone();
        self.spawn_watch(Query::kind(namespace, ty), DependencyKind::DestroyReady)
            .await?;

        self.wake_tx.send_modify(|wakeups| *wakeups += 1);

        Ok(())
    }

    async fn spawn_watch(&self, query: Query, kind: DependencyKind) -> Result<(), Error> {
        let mut events = self.state.watch(query).await?;
        let wake_tx = self.wake_tx.clone();
        let shutdown = self.shutdown.clone();
        let name = self.name;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            if wakes(kind, &event) {
                                trace!(controller = name, resource = %event.resource.metadata(), "input changed");
                                wake_tx.send_modify(|wakeups| *wakeups += 1);
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(())
    }

    /// Waits for the next (coalesced) input change.
    pub async fn event(&mut self) {
        // The sender lives in this struct, so changed() can't fail.
        let _ = self.wake_rx.changed().await;
    }

    pub async fn get(&self, namespace: &str, ty: &str, id: &str) -> Result<Resource, Error> {
        self.state.get(namespace, ty, id).await
    }

    pub async fn list(&self, namespace: &str, ty: &str) -> Result<Vec<Resource>, Error> {
        self.state.list(namespace, ty).await
    }

    /// Idempotent upsert of one of this controller's outputs.
    pub async fn modify(&self, resource: Resource) -> Result<Resource, Error> {
        self.check_output(resource.metadata().namespace(), resource.metadata().ty())?;

        self.state.modify(resource).await
    }

    pub async fn teardown(&self, namespace: &str, ty: &str, id: &str) -> Result<bool, Error> {
        self.check_output(namespace, ty)?;

        self.state.teardown(namespace, ty, id).await
    }

    pub async fn destroy(&self, namespace: &str, ty: &str, id: &str) -> Result<(), Error> {
        self.check_output(namespace, ty)?;

        self.state.destroy(namespace, ty, id).await
    }

    pub async fn add_finalizer(
        &self,
        namespace: &str,
        ty: &str,
        id: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.state.add_finalizer(namespace, ty, id, finalizer).await
    }

    pub async fn remove_finalizer(
        &self,
        namespace: &str,
        ty: &str,
        id: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        self.state
            .remove_finalizer(namespace, ty, id, finalizer)
            .await
    }

    fn check_output(&self, namespace: &str, ty: &str) -> Result<(), Error> {
        if self.output.0 != namespace || self.output.1 != ty {
            return Err(Error::PermissionDenied {
                controller: self.name.to_string(),
                namespace: namespace.to_string(),
                ty: ty.to_string(),
            });
        }

        Ok(())
    }
}

fn wakes(kind: DependencyKind, event: &Event) -> bool {
    match kind {
        DependencyKind::Weak | DependencyKind::Hard => true,
        DependencyKind::DestroyReady => {
            event.resource.metadata().phase() == Phase::TearingDown
                && event.resource.metadata().finalizers().is_empty()
        }
    }
}
