use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use rudder_state::State;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backoff::RestartBackoff;
use crate::controller::Controller;
use crate::handle::ControllerContext;

/// Owns the registered controllers and runs each one as its own task.
///
/// Controllers run concurrently with respect to each other, but a single
/// controller never has two overlapping invocations: the runtime drives one
/// call to [`Controller::run`] at a time and restarts it with backoff when
/// it fails.
pub struct Runtime {
    state: State,
    controllers: Vec<Arc<dyn Controller>>,
}

impl Runtime {
    pub fn new(state: State) -> Self {
        Runtime {
            state,
            controllers: Vec::new(),
        }
    }

    /// Registers a controller. Controller names must be unique.
    pub fn register(&mut self, controller: impl Controller) -> anyhow::Result<()> {
        let names: HashSet<_> = self.controllers.iter().map(|c| c.name()).collect();

        if names.contains(controller.name()) {
            return Err(anyhow!("controller {} is already registered", controller.name()));
        }

        self.controllers.push(Arc::new(controller));

        Ok(())
    }

    /// Runs every registered controller until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut tasks = Vec::with_capacity(self.controllers.len());

        for controller in self.controllers {
            let state = self.state.clone();
            let shutdown = shutdown.clone();

            tasks.push(tokio::spawn(run_controller(state, controller, shutdown)));
        }

        for task in tasks {
            task.await?;
        }

        info!("controller runtime finished");

        Ok(())
    }
}

/// Drives a single controller: run, and on error restart with backoff. A
/// clean return means the controller considers itself done.
async fn run_controller(
    state: State,
    controller: Arc<dyn Controller>,
    shutdown: CancellationToken,
) {
    let name = controller.name();
    let (namespace, ty) = controller.outputs();
    let output = (namespace.to_string(), ty.to_string());

    let mut backoff = RestartBackoff::default();

    loop {
        let mut ctx =
            ControllerContext::new(name, output.clone(), state.clone(), shutdown.clone());

        debug!(controller = name, "starting controller");

        match controller.run(&mut ctx).await {
            Ok(()) => {
                debug!(controller = name, "controller finished");
                return;
            }
            Err(err) => {
                error!(controller = name, error = %err, "controller failed, restarting");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = backoff.wait() => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::controller::Dependency;
    use async_trait::async_trait;
    use rudder_state::registry;
    use rudder_state::resources::{k8s, legacy};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Mirrors the running flag of every legacy service into a static pod
    /// status of the same id.
    struct MirrorController;

    #[async_trait]
    impl Controller for MirrorController {
        fn name(&self) -> &'static str {
            "test.MirrorController"
        }

        fn outputs(&self) -> (&str, &str) {
            (k8s::NAMESPACE, k8s::STATIC_POD_STATUS_TYPE)
        }

        async fn run(&self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
            ctx.update_dependencies(vec![Dependency::weak(
                legacy::NAMESPACE,
                legacy::SERVICE_TYPE,
            )])
            .await?;

            let shutdown = ctx.shutdown();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = ctx.event() => {}
                }

                for service in ctx.list(legacy::NAMESPACE, legacy::SERVICE_TYPE).await? {
                    let running = service.spec().as_service().map(|s| s.running).unwrap_or(false);

                    ctx.modify(k8s::new_static_pod_status(
                        service.metadata().id(),
                        running,
                    ))
                    .await?;
                }
            }
        }
    }

    /// Fails on its first run, then runs clean.
    struct FlakyController {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Controller for FlakyController {
        fn name(&self) -> &'static str {
            "test.FlakyController"
        }

        fn outputs(&self) -> (&str, &str) {
            (k8s::NAMESPACE, k8s::STATIC_POD_STATUS_TYPE)
        }

        async fn run(&self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transient failure");
            }

            let shutdown = ctx.shutdown();
            shutdown.cancelled().await;

            Ok(())
        }
    }

    async fn new_state() -> State {
        let state = State::new();
        registry::register_defaults(&state).await.unwrap();
        state
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn controller_reconciles_input_changes() {
        let state = new_state().await;
        let shutdown = CancellationToken::new();

        let mut runtime = Runtime::new(state.clone());
        runtime.register(MirrorController).unwrap();
        let handle = tokio::spawn(runtime.run(shutdown.clone()));

        state.modify(legacy::new_service("kubelet", true)).await.unwrap();

        let probe = state.clone();
        wait_for(|| {
            let state = probe.clone();
            async move {
                match state
                    .get(k8s::NAMESPACE, k8s::STATIC_POD_STATUS_TYPE, "kubelet")
                    .await
                {
                    Ok(status) => status
                        .spec()
                        .as_static_pod_status()
                        .map(|s| s.running)
                        .unwrap_or(false),
                    Err(_) => false,
                }
            }
        })
        .await;

        state.modify(legacy::new_service("kubelet", false)).await.unwrap();

        let probe = state.clone();
        wait_for(|| {
            let state = probe.clone();
            async move {
                match state
                    .get(k8s::NAMESPACE, k8s::STATIC_POD_STATUS_TYPE, "kubelet")
                    .await
                {
                    Ok(status) => status
                        .spec()
                        .as_static_pod_status()
                        .map(|s| !s.running)
                        .unwrap_or(false),
                    Err(_) => false,
                }
            }
        })
        .await;

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_controllers_are_restarted() {
        let state = new_state().await;
        let shutdown = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        let mut runtime = Runtime::new(state);
        runtime
            .register(FlakyController {
                attempts: attempts.clone(),
            })
            .unwrap();
        let handle = tokio::spawn(runtime.run(shutdown.clone()));

        let probe = attempts.clone();
        wait_for(|| {
            let attempts = probe.clone();
            async move { attempts.load(Ordering::SeqCst) >= 2 }
        })
        .await;

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn duplicate_controller_names_are_rejected() {
        let state = new_state().await;

        let mut runtime = Runtime::new(state);
        runtime.register(MirrorController).unwrap();
        assert!(runtime.register(MirrorController).is_err());
    }
}
