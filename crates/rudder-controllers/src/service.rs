//! Bridge between the legacy service subsystem and the resource store.

use std::sync::Arc;

use async_trait::async_trait;
use rudder_runtime::{Controller, ControllerContext};
use rudder_state::resources::legacy;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Lifecycle action reported for a supervised system service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Preparing,
    Running,
    Stopping,
    Finished,
    Failed,
}

/// One service lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    pub service: String,
    pub action: ServiceAction,
}

impl ServiceEvent {
    pub fn new(service: impl Into<String>, action: ServiceAction) -> Self {
        ServiceEvent {
            service: service.into(),
            action,
        }
    }
}

/// How much history a new watch replays before going live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    /// Replay every retained event (the `-1` of the event API).
    Earliest,
    /// Live events only.
    Live,
}

#[derive(Default)]
struct BusInner {
    history: Vec<ServiceEvent>,
    subscribers: Vec<mpsc::UnboundedSender<ServiceEvent>>,
}

/// In-process service event bus.
///
/// Publishers are the init subsystem's supervisors; the only consumer in
/// this process is [`ServiceController`]. Events are retained so a watcher
/// can tail from the earliest event and still observe services that came up
/// before it subscribed.
#[derive(Clone, Default)]
pub struct ServiceEvents {
    inner: Arc<Mutex<BusInner>>,
}

impl ServiceEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, event: ServiceEvent) {
        let mut inner = self.inner.lock().await;

        inner
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        inner.history.push(event);
    }

    /// Subscribes to the bus, optionally replaying history first.
    pub async fn watch(&self, tail: Tail) -> mpsc::UnboundedReceiver<ServiceEvent> {
        let mut inner = self.inner.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();

        if tail == Tail::Earliest {
            for event in &inner.history {
                // Receiver is still in scope here.
                let _ = tx.send(event.clone());
            }
        }

        inner.subscribers.push(tx);

        rx
    }
}

/// Reflects service lifecycle events into `legacy/service` resources.
///
/// A `Running` event upserts the service with `running: true`; any other
/// action destroys the resource (a service that isn't running might as well
/// not exist as far as the other controllers are concerned).
pub struct ServiceController {
    events: ServiceEvents,
}

impl ServiceController {
    pub fn new(events: ServiceEvents) -> Self {
        ServiceController { events }
    }
}

#[async_trait]
impl Controller for ServiceController {
    fn name(&self) -> &'static str {
        "legacy.ServiceController"
    }

    fn outputs(&self) -> (&str, &str) {
        (legacy::NAMESPACE, legacy::SERVICE_TYPE)
    }

    async fn run(&self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        let mut events = self.events.watch(Tail::Earliest).await;
        let shutdown = ctx.shutdown();

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
            };

            debug!(service = %event.service, action = ?event.action, "service event");

            match event.action {
                ServiceAction::Running => {
                    if let Err(err) = ctx
                        .modify(legacy::new_service(event.service.clone(), true))
                        .await
                    {
                        warn!(service = %event.service, error = %err, "failed updating service resource");
                    }
                }
                _ => {
                    match ctx
                        .destroy(legacy::NAMESPACE, legacy::SERVICE_TYPE, &event.service)
                        .await
                    {
                        Ok(()) => {}
                        Err(err) if err.is_not_found() => {}
                        Err(err) => {
                            warn!(service = %event.service, error = %err, "failed destroying service resource");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rudder_runtime::Runtime;
    use rudder_state::{registry, State};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn watch_from_earliest_replays_history() {
        let events = ServiceEvents::new();

        events
            .publish(ServiceEvent::new("kubelet", ServiceAction::Running))
            .await;

        let mut replayed = events.watch(Tail::Earliest).await;
        assert_eq!(
            replayed.recv().await.unwrap(),
            ServiceEvent::new("kubelet", ServiceAction::Running)
        );

        let mut live = events.watch(Tail::Live).await;
        events
            .publish(ServiceEvent::new("etcd", ServiceAction::Running))
            .await;
        assert_eq!(
            live.recv().await.unwrap(),
            ServiceEvent::new("etcd", ServiceAction::Running)
        );
    }

    #[tokio::test]
    async fn service_events_become_resources() {
        let state = State::new();
        registry::register_defaults(&state).await.unwrap();
        let events = ServiceEvents::new();
        let shutdown = CancellationToken::new();

        // Published before the controller starts; the tail replay picks it up.
        events
            .publish(ServiceEvent::new("kubelet", ServiceAction::Running))
            .await;

        let mut runtime = Runtime::new(state.clone());
        runtime.register(ServiceController::new(events.clone())).unwrap();
        let handle = tokio::spawn(runtime.run(shutdown.clone()));

        wait_for(&state, |state| async move {
            state
                .get(legacy::NAMESPACE, legacy::SERVICE_TYPE, "kubelet")
                .await
                .map(|r| r.spec().as_service().map(|s| s.running).unwrap_or(false))
                .unwrap_or(false)
        })
        .await;

        events
            .publish(ServiceEvent::new("kubelet", ServiceAction::Finished))
            .await;

        wait_for(&state, |state| async move {
            state
                .get(legacy::NAMESPACE, legacy::SERVICE_TYPE, "kubelet")
                .await
                .is_err()
        })
        .await;

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    async fn wait_for<F, Fut>(state: &State, check: F)
    where
        F: Fn(State) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check(state.clone()).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }
}
