//! End-to-end reconciliation scenarios: a machine configuration document
//! goes in, static pod manifest files come out (or go away) as the machine
//! type and kubelet state change.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rudder_controllers::{
    ControlPlaneStaticPodController, K8sControlPlaneController, KubeletStaticPodController,
    MachineTypeController, ServiceAction, ServiceController, ServiceEvent, ServiceEvents,
};
use rudder_runtime::Runtime;
use rudder_state::resources::{config, k8s};
use rudder_state::{registry, State};
use tokio_util::sync::CancellationToken;

struct Harness {
    state: State,
    events: ServiceEvents,
    manifests: PathBuf,
    shutdown: CancellationToken,
    runtime: tokio::task::JoinHandle<anyhow::Result<()>>,
    _tempdir: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Self {
        let tempdir = tempfile::tempdir().expect("creating tempdir");
        let manifests = tempdir.path().join("etc/kubernetes/manifests");

        let state = State::new();
        registry::register_defaults(&state)
            .await
            .expect("registering defaults");

        let events = ServiceEvents::new();
        let shutdown = CancellationToken::new();

        let mut runtime = Runtime::new(state.clone());
        runtime
            .register(ServiceController::new(events.clone()))
            .unwrap();
        runtime.register(MachineTypeController).unwrap();
        runtime.register(K8sControlPlaneController).unwrap();
        runtime.register(ControlPlaneStaticPodController).unwrap();
        runtime
            .register(KubeletStaticPodController::new(&manifests))
            .unwrap();

        let runtime = tokio::spawn(runtime.run(shutdown.clone()));

        Harness {
            state,
            events,
            manifests,
            shutdown,
            runtime,
            _tempdir: tempdir,
        }
    }

    fn manifest(&self, id: &str) -> PathBuf {
        self.manifests.join(format!("{}.yaml", id))
    }

    async fn boot_control_plane(&self) {
        self.state
            .create(config::new_machine_config(control_plane_config()))
            .await
            .unwrap();
        self.events
            .publish(ServiceEvent::new("kubelet", ServiceAction::Running))
            .await;

        let manifest = self.manifest("kube-apiserver");
        wait_until(move || {
            let manifest = manifest.clone();
            async move { manifest.exists() }
        })
        .await;
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.runtime.await.unwrap().unwrap();
    }
}

fn control_plane_config() -> config::MachineConfig {
    config::MachineConfig::from_yaml(
        r#"
machine:
  type: controlplane
cluster:
  controlPlane:
    endpoint: https://cp:6443
  apiServer:
    image: k8s.gcr.io/kube-apiserver:v1.20.2
    extraArgs:
      feature-gates: AllBeta=true
      audit-log-format: json
  network:
    serviceSubnets:
      - 10.96.0.0/12
"#,
    )
    .expect("parsing machine config")
}

fn worker_config() -> config::MachineConfig {
    config::MachineConfig::from_yaml("machine:\n  type: worker\n").expect("parsing machine config")
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

fn file_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path).unwrap().permissions().mode() & 0o777
}

#[tokio::test]
async fn cold_start_renders_the_apiserver_manifest() {
    let harness = Harness::start().await;

    harness.boot_control_plane().await;

    let manifest = harness.manifest("kube-apiserver");
    let contents = std::fs::read_to_string(&manifest).unwrap();
    assert!(contents.contains("--service-cluster-ip-range=10.96.0.0/12"));
    assert!(contents.contains("--secure-port=6443"));
    assert!(contents.contains("--etcd-servers=https://127.0.0.1:2379"));
    assert!(contents.contains("image: k8s.gcr.io/kube-apiserver:v1.20.2"));

    // Extra args are appended sorted by key.
    let audit = contents.find("--audit-log-format=json").unwrap();
    let gates = contents.find("--feature-gates=AllBeta=true").unwrap();
    assert!(audit < gates);

    assert_eq!(file_mode(&manifest), 0o600);

    harness.stop().await;
}

#[tokio::test]
async fn reconfiguring_as_a_worker_removes_the_control_plane() {
    let harness = Harness::start().await;

    harness.boot_control_plane().await;

    let current = harness
        .state
        .get(
            config::NAMESPACE,
            config::MACHINE_CONFIG_TYPE,
            config::MACHINE_CONFIG_ID,
        )
        .await
        .unwrap();
    harness
        .state
        .update(
            current.metadata().version(),
            config::new_machine_config(worker_config()),
        )
        .await
        .unwrap();

    let manifest = harness.manifest("kube-apiserver");
    wait_until(move || {
        let manifest = manifest.clone();
        async move { !manifest.exists() }
    })
    .await;

    // The static pod definition is destroyed once the renderer released its
    // claim.
    let state = harness.state.clone();
    wait_until(move || {
        let state = state.clone();
        async move {
            state
                .get(k8s::NAMESPACE, k8s::STATIC_POD_TYPE, "kube-apiserver")
                .await
                .is_err()
        }
    })
    .await;

    harness.stop().await;
}

#[tokio::test]
async fn stopping_the_kubelet_clears_rendered_manifests() {
    let harness = Harness::start().await;

    harness.boot_control_plane().await;

    harness
        .events
        .publish(ServiceEvent::new("kubelet", ServiceAction::Stopping))
        .await;

    let manifest = harness.manifest("kube-apiserver");
    wait_until(move || {
        let manifest = manifest.clone();
        async move { !manifest.exists() }
    })
    .await;

    // The definition survives, but the renderer's claim and the rendered
    // status are gone.
    let state = harness.state.clone();
    wait_until(move || {
        let state = state.clone();
        async move {
            state
                .get(k8s::NAMESPACE, k8s::STATIC_POD_TYPE, "kube-apiserver")
                .await
                .map(|pod| pod.metadata().finalizers().is_empty())
                .unwrap_or(false)
        }
    })
    .await;

    let state = harness.state.clone();
    wait_until(move || {
        let state = state.clone();
        async move {
            state
                .get(k8s::NAMESPACE, k8s::STATIC_POD_STATUS_TYPE, "kube-apiserver")
                .await
                .is_err()
        }
    })
    .await;

    harness.stop().await;
}
