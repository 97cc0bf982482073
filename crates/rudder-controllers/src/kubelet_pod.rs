use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use rudder_runtime::{Controller, ControllerContext, Dependency};
use rudder_state::resources::{k8s, legacy};
use rudder_state::{Phase, Resource};
use tracing::{debug, info};

/// Renders static pod definitions into the kubelet's manifests directory.
///
/// Files only exist while the kubelet service is running; each rendered pod
/// is claimed with a finalizer so its definition can't be destroyed before
/// the file is removed again. The rendered state is mirrored into
/// `k8s/staticPodStatus` resources.
pub struct KubeletStaticPodController {
    manifests_dir: PathBuf,
}

impl KubeletStaticPodController {
    pub fn new(manifests_dir: impl Into<PathBuf>) -> Self {
        KubeletStaticPodController {
            manifests_dir: manifests_dir.into(),
        }
    }

    fn pod_path(&self, id: &str) -> PathBuf {
        self.manifests_dir.join(format!("{}.yaml", id))
    }
}

#[async_trait]
impl Controller for KubeletStaticPodController {
    fn name(&self) -> &'static str {
        "k8s.KubeletStaticPodController"
    }

    fn outputs(&self) -> (&str, &str) {
        (k8s::NAMESPACE, k8s::STATIC_POD_STATUS_TYPE)
    }

    async fn run(&self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        ctx.update_dependencies(vec![
            Dependency::hard(k8s::NAMESPACE, k8s::STATIC_POD_TYPE),
            Dependency::weak(legacy::NAMESPACE, legacy::SERVICE_TYPE)
                .with_id(legacy::KUBELET_SERVICE_ID),
        ])
        .await?;

        let shutdown = ctx.shutdown();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ctx.event() => {}
            }

            let kubelet_running = match ctx
                .get(
                    legacy::NAMESPACE,
                    legacy::SERVICE_TYPE,
                    legacy::KUBELET_SERVICE_ID,
                )
                .await
            {
                Ok(resource) => resource
                    .spec()
                    .as_service()
                    .map(|service| service.running)
                    .unwrap_or(false),
                Err(err) if err.is_not_found() => false,
                Err(err) => return Err(err.into()),
            };

            if !kubelet_running {
                self.teardown_all(ctx).await.context("error tearing down")?;

                continue;
            }

            for pod in ctx.list(k8s::NAMESPACE, k8s::STATIC_POD_TYPE).await? {
                match pod.metadata().phase() {
                    Phase::Running => {
                        self.run_pod(ctx, &pod).await.context("error running pod")?;
                    }
                    Phase::TearingDown => {
                        self.teardown_pod(ctx, &pod)
                            .await
                            .context("error tearing down pod")?;
                    }
                }
            }
        }
    }
}

impl KubeletStaticPodController {
    async fn run_pod(&self, ctx: &ControllerContext, pod: &Resource) -> anyhow::Result<()> {
        let id = pod.metadata().id();
        let finalizer = k8s::static_pod_status_finalizer(pod.metadata().namespace(), id);

        ctx.add_finalizer(
            pod.metadata().namespace(),
            pod.metadata().ty(),
            id,
            &finalizer,
        )
        .await?;

        // Assert the payload type before rendering, so a wiring mistake shows
        // up as an error instead of a bogus manifest.
        pod.spec()
            .as_static_pod()
            .context("unexpected spec on static pod resource")?;

        let rendered = pod.spec().to_yaml()?;

        if write_manifest(&self.pod_path(id), rendered.as_bytes()).await? {
            info!(path = %self.pod_path(id).display(), "rendered static pod definition");
        }

        ctx.modify(k8s::new_static_pod_status(id, true)).await?;

        Ok(())
    }

    async fn teardown_pod(&self, ctx: &ControllerContext, pod: &Resource) -> anyhow::Result<()> {
        let id = pod.metadata().id();

        remove_manifest(&self.pod_path(id)).await?;
        self.destroy_status(ctx, id).await?;

        let finalizer = k8s::static_pod_status_finalizer(pod.metadata().namespace(), id);
        ctx.remove_finalizer(
            pod.metadata().namespace(),
            pod.metadata().ty(),
            id,
            &finalizer,
        )
        .await?;

        debug!(id = id, "released static pod");

        Ok(())
    }

    /// The kubelet is gone: remove every manifest this controller wrote and
    /// release the claims on the static pod definitions so their owner can
    /// destroy them.
    async fn teardown_all(&self, ctx: &ControllerContext) -> anyhow::Result<()> {
        for status in ctx.list(k8s::NAMESPACE, k8s::STATIC_POD_STATUS_TYPE).await? {
            let id = status.metadata().id();

            remove_manifest(&self.pod_path(id)).await?;
            self.destroy_status(ctx, id).await?;
        }

        for pod in ctx.list(k8s::NAMESPACE, k8s::STATIC_POD_TYPE).await? {
            let finalizer =
                k8s::static_pod_status_finalizer(pod.metadata().namespace(), pod.metadata().id());

            ctx.remove_finalizer(
                pod.metadata().namespace(),
                pod.metadata().ty(),
                pod.metadata().id(),
                &finalizer,
            )
            .await?;
        }

        Ok(())
    }

    async fn destroy_status(&self, ctx: &ControllerContext, id: &str) -> anyhow::Result<()> {
        match ctx
            .teardown(k8s::NAMESPACE, k8s::STATIC_POD_STATUS_TYPE, id)
            .await
        {
            Ok(true) => {
                ctx.destroy(k8s::NAMESPACE, k8s::STATIC_POD_STATUS_TYPE, id)
                    .await?;
            }
            // Finalizers on a status delay destruction until their owner
            // releases them; nothing in-tree attaches any today.
            Ok(false) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        Ok(())
    }
}

/// Writes `contents` to `path` with mode 0600 using a write-then-rename so
/// the kubelet never observes a partial manifest. Returns `false` when the
/// file already holds identical bytes and nothing was written.
async fn write_manifest(path: &Path, contents: &[u8]) -> anyhow::Result<bool> {
    match tokio::fs::read(path).await {
        Ok(existing) if existing == contents => return Ok(false),
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let directory = path.parent().context("manifest path has no parent")?;
    tokio::fs::create_dir_all(directory).await?;

    let staging = path.with_extension("yaml.tmp");
    tokio::fs::write(&staging, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        tokio::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o600)).await?;
    }

    tokio::fs::rename(&staging, path).await?;

    Ok(true)
}

/// Removes a manifest, treating a missing file as success.
async fn remove_manifest(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rudder_runtime::Runtime;
    use rudder_state::{registry, State};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn new_state() -> State {
        let state = State::new();
        registry::register_defaults(&state).await.unwrap();
        state
    }

    fn sample_pod() -> k8s_openapi::api::core::v1::Pod {
        k8s_openapi::api::core::v1::Pod {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("kube-apiserver-static".to_string()),
                namespace: Some("kube-system".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..150 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn renders_manifest_while_kubelet_runs() {
        let state = new_state().await;
        let tempdir = tempfile::tempdir().unwrap();
        let manifests = tempdir.path().join("manifests");
        let shutdown = CancellationToken::new();

        let mut runtime = Runtime::new(state.clone());
        runtime
            .register(KubeletStaticPodController::new(&manifests))
            .unwrap();
        let handle = tokio::spawn(runtime.run(shutdown.clone()));

        state
            .modify(k8s::new_static_pod("kube-apiserver", sample_pod()))
            .await
            .unwrap();
        state
            .modify(legacy::new_service(legacy::KUBELET_SERVICE_ID, true))
            .await
            .unwrap();

        let manifest = manifests.join("kube-apiserver.yaml");
        let probe = manifest.clone();
        wait_for(move || {
            let path = probe.clone();
            async move { path.exists() }
        })
        .await;

        // Contents equal the serialized pod spec, file mode is 0600.
        let pod = state
            .get(k8s::NAMESPACE, k8s::STATIC_POD_TYPE, "kube-apiserver")
            .await
            .unwrap();
        let contents = std::fs::read_to_string(&manifest).unwrap();
        assert_eq!(contents, pod.spec().to_yaml().unwrap());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mode = std::fs::metadata(&manifest).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        // The pod now carries the renderer's finalizer and a status exists.
        assert!(pod
            .metadata()
            .finalizers()
            .iter()
            .any(|f| f == k8s::static_pod_status_finalizer(k8s::NAMESPACE, "kube-apiserver")));

        let status = state
            .get(k8s::NAMESPACE, k8s::STATIC_POD_STATUS_TYPE, "kube-apiserver")
            .await
            .unwrap();
        assert!(status.spec().as_static_pod_status().unwrap().running);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stopping_the_kubelet_removes_manifests_and_finalizers() {
        let state = new_state().await;
        let tempdir = tempfile::tempdir().unwrap();
        let manifests = tempdir.path().join("manifests");
        let shutdown = CancellationToken::new();

        let mut runtime = Runtime::new(state.clone());
        runtime
            .register(KubeletStaticPodController::new(&manifests))
            .unwrap();
        let handle = tokio::spawn(runtime.run(shutdown.clone()));

        state
            .modify(k8s::new_static_pod("kube-apiserver", sample_pod()))
            .await
            .unwrap();
        state
            .modify(legacy::new_service(legacy::KUBELET_SERVICE_ID, true))
            .await
            .unwrap();

        let manifest = manifests.join("kube-apiserver.yaml");
        let probe = manifest.clone();
        wait_for(move || {
            let path = probe.clone();
            async move { path.exists() }
        })
        .await;

        state
            .modify(legacy::new_service(legacy::KUBELET_SERVICE_ID, false))
            .await
            .unwrap();

        let probe = manifest.clone();
        wait_for(move || {
            let path = probe.clone();
            async move { !path.exists() }
        })
        .await;

        let probe = state.clone();
        wait_for(move || {
            let state = probe.clone();
            async move {
                state
                    .get(k8s::NAMESPACE, k8s::STATIC_POD_TYPE, "kube-apiserver")
                    .await
                    .map(|pod| pod.metadata().finalizers().is_empty())
                    .unwrap_or(false)
            }
        })
        .await;

        let probe = state.clone();
        wait_for(move || {
            let state = probe.clone();
            async move {
                state
                    .get(k8s::NAMESPACE, k8s::STATIC_POD_STATUS_TYPE, "kube-apiserver")
                    .await
                    .is_err()
            }
        })
        .await;

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tearing_down_a_pod_releases_the_claim() {
        let state = new_state().await;
        let tempdir = tempfile::tempdir().unwrap();
        let manifests = tempdir.path().join("manifests");
        let shutdown = CancellationToken::new();

        let mut runtime = Runtime::new(state.clone());
        runtime
            .register(KubeletStaticPodController::new(&manifests))
            .unwrap();
        let handle = tokio::spawn(runtime.run(shutdown.clone()));

        state
            .modify(k8s::new_static_pod("kube-apiserver", sample_pod()))
            .await
            .unwrap();
        state
            .modify(legacy::new_service(legacy::KUBELET_SERVICE_ID, true))
            .await
            .unwrap();

        let manifest = manifests.join("kube-apiserver.yaml");
        let probe = manifest.clone();
        wait_for(move || {
            let path = probe.clone();
            async move { path.exists() }
        })
        .await;

        // The owner requests destruction; the renderer must remove the file
        // and release its finalizer so the pod becomes destroyable.
        let ready = state
            .teardown(k8s::NAMESPACE, k8s::STATIC_POD_TYPE, "kube-apiserver")
            .await
            .unwrap();
        assert!(!ready, "renderer still holds a finalizer");

        let probe = state.clone();
        wait_for(move || {
            let state = probe.clone();
            async move {
                state
                    .get(k8s::NAMESPACE, k8s::STATIC_POD_TYPE, "kube-apiserver")
                    .await
                    .map(|pod| pod.metadata().finalizers().is_empty())
                    .unwrap_or(false)
            }
        })
        .await;
        assert!(!manifest.exists());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn identical_manifests_are_not_rewritten() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("kube-apiserver.yaml");

        assert!(write_manifest(&path, b"spec\n").await.unwrap());
        assert!(!write_manifest(&path, b"spec\n").await.unwrap());
        assert!(write_manifest(&path, b"changed\n").await.unwrap());
    }

    #[tokio::test]
    async fn removing_a_missing_manifest_is_fine() {
        let tempdir = tempfile::tempdir().unwrap();

        remove_manifest(&tempdir.path().join("absent.yaml"))
            .await
            .unwrap();
    }
}
