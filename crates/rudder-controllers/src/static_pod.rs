use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, HostPathVolumeSource, ObjectFieldSelector, Pod,
    PodSecurityContext, PodSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rudder_runtime::{Controller, ControllerContext, Dependency};
use rudder_state::resources::{config, k8s};
use tracing::debug;

/// Manages `k8s/staticPod` definitions from the control plane configuration.
///
/// On nodes that don't run the control plane all owned static pods are torn
/// down; on control plane nodes each known component's configuration is
/// expanded into a full pod document.
pub struct ControlPlaneStaticPodController;

#[async_trait]
impl Controller for ControlPlaneStaticPodController {
    fn name(&self) -> &'static str {
        "k8s.ControlPlaneStaticPodController"
    }

    fn outputs(&self) -> (&str, &str) {
        (k8s::NAMESPACE, k8s::STATIC_POD_TYPE)
    }

    async fn run(&self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        ctx.update_dependencies(vec![
            Dependency::weak(config::NAMESPACE, config::K8S_CONTROL_PLANE_TYPE),
            Dependency::weak(config::NAMESPACE, config::MACHINE_TYPE_TYPE)
                .with_id(config::MACHINE_TYPE_ID),
        ])
        .await?;

        let shutdown = ctx.shutdown();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ctx.event() => {}
            }

            let machine_type = match ctx
                .get(
                    config::NAMESPACE,
                    config::MACHINE_TYPE_TYPE,
                    config::MACHINE_TYPE_ID,
                )
                .await
            {
                Ok(resource) => resource
                    .spec()
                    .as_machine_type()
                    .context("unexpected spec on machine type resource")?,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err).context("error getting machine type"),
            };

            if !machine_type.is_control_plane() {
                self.teardown_all(ctx)
                    .await
                    .context("error destroying static pods")?;

                continue;
            }

            for id in [config::API_SERVER_ID] {
                let component = match ctx
                    .get(config::NAMESPACE, config::K8S_CONTROL_PLANE_TYPE, id)
                    .await
                {
                    Ok(resource) => resource,
                    Err(err) if err.is_not_found() => continue,
                    Err(err) => return Err(err).context("error getting control plane config"),
                };

                let api_server = component
                    .spec()
                    .as_api_server()
                    .context("unexpected spec on control plane config resource")?;

                ctx.modify(k8s::new_static_pod(id, build_api_server_pod(api_server)))
                    .await
                    .with_context(|| format!("error updating static pod for {:?}", id))?;
            }
        }
    }
}

impl ControlPlaneStaticPodController {
    /// Tears down every owned static pod, destroying the ones whose
    /// finalizers are already gone. The rest are picked up again once the
    /// manifest renderer releases its claim.
    async fn teardown_all(&self, ctx: &ControllerContext) -> anyhow::Result<()> {
        for pod in ctx.list(k8s::NAMESPACE, k8s::STATIC_POD_TYPE).await? {
            let id = pod.metadata().id();

            let ready = ctx.teardown(k8s::NAMESPACE, k8s::STATIC_POD_TYPE, id).await?;

            if ready {
                debug!(id = id, "destroying static pod");
                ctx.destroy(k8s::NAMESPACE, k8s::STATIC_POD_TYPE, id).await?;
            }
        }

        Ok(())
    }
}

/// Expands the API server configuration into a static pod document.
///
/// The argument list is fixed and ordered; `extraArgs` are appended sorted
/// by key so repeated renderings are byte-identical. Missing optional config
/// fields render as empty flag values rather than omitted flags.
fn build_api_server_pod(cfg: &config::ApiServerConfig) -> Pod {
    let mut command = vec![
        "/go-runner".to_string(),
        "/usr/local/bin/kube-apiserver".to_string(),
        "--enable-admission-plugins=PodSecurityPolicy,NamespaceLifecycle,LimitRanger,ServiceAccount,PersistentVolumeClaimResize,DefaultStorageClass,DefaultTolerationSeconds,MutatingAdmissionWebhook,ValidatingAdmissionWebhook,ResourceQuota,Priority,NodeRestriction".to_string(),
        "--advertise-address=$(POD_IP)".to_string(),
        "--allow-privileged=true".to_string(),
        format!("--api-audiences={}", cfg.control_plane_endpoint),
        "--authorization-mode=Node,RBAC".to_string(),
        "--bind-address=0.0.0.0".to_string(),
        "--client-ca-file=/etc/kubernetes/secrets/ca.crt".to_string(),
        "--requestheader-client-ca-file=/etc/kubernetes/secrets/front-proxy-ca.crt".to_string(),
        "--requestheader-allowed-names=front-proxy-client".to_string(),
        "--requestheader-extra-headers-prefix=X-Remote-Extra-".to_string(),
        "--requestheader-group-headers=X-Remote-Group".to_string(),
        "--requestheader-username-headers=X-Remote-User".to_string(),
        "--proxy-client-cert-file=/etc/kubernetes/secrets/front-proxy-client.crt".to_string(),
        "--proxy-client-key-file=/etc/kubernetes/secrets/front-proxy-client.key".to_string(),
        "--cloud-provider=".to_string(),
        "--enable-bootstrap-token-auth=true".to_string(),
        "--tls-cipher-suites=TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305,TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305,TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,TLS_RSA_WITH_AES_256_GCM_SHA384,TLS_RSA_WITH_AES_128_GCM_SHA256".to_string(),
        "--encryption-provider-config=/etc/kubernetes/secrets/encryptionconfig.yaml".to_string(),
        "--audit-policy-file=/etc/kubernetes/secrets/auditpolicy.yaml".to_string(),
        "--audit-log-path=-".to_string(),
        "--audit-log-maxage=30".to_string(),
        "--audit-log-maxbackup=3".to_string(),
        "--audit-log-maxsize=50".to_string(),
        "--profiling=false".to_string(),
        "--etcd-cafile=/etc/kubernetes/secrets/etcd-client-ca.crt".to_string(),
        "--etcd-certfile=/etc/kubernetes/secrets/etcd-client.crt".to_string(),
        "--etcd-keyfile=/etc/kubernetes/secrets/etcd-client.key".to_string(),
        format!("--etcd-servers={}", cfg.etcd_servers.join(",")),
        "--insecure-port=0".to_string(),
        "--kubelet-client-certificate=/etc/kubernetes/secrets/apiserver-kubelet-client.crt".to_string(),
        "--kubelet-client-key=/etc/kubernetes/secrets/apiserver-kubelet-client.key".to_string(),
        format!("--secure-port={}", cfg.local_port),
        format!("--service-account-issuer={}", cfg.control_plane_endpoint),
        "--service-account-key-file=/etc/kubernetes/secrets/service-account.pub".to_string(),
        "--service-account-signing-key-file=/etc/kubernetes/secrets/service-account.key".to_string(),
        format!("--service-cluster-ip-range={}", cfg.service_cidr),
        "--tls-cert-file=/etc/kubernetes/secrets/apiserver.crt".to_string(),
        "--tls-private-key-file=/etc/kubernetes/secrets/apiserver.key".to_string(),
        "--kubelet-preferred-address-types=InternalIP,ExternalIP,Hostname".to_string(),
    ];

    // BTreeMap iteration order keeps the appended flags sorted by key.
    for (key, value) in &cfg.extra_args {
        command.push(format!("--{}={}", key, value));
    }

    Pod {
        metadata: ObjectMeta {
            name: Some("kube-apiserver-static".to_string()),
            namespace: Some("kube-system".to_string()),
            labels: Some(
                [
                    ("tier".to_string(), "control-plane".to_string()),
                    ("k8s-app".to_string(), "kube-apiserver".to_string()),
                ]
                .into(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "kube-apiserver".to_string(),
                image: Some(cfg.image.clone()),
                command: Some(command),
                env: Some(vec![EnvVar {
                    name: "POD_IP".to_string(),
                    value_from: Some(EnvVarSource {
                        field_ref: Some(ObjectFieldSelector {
                            field_path: "status.podIP".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: "ssl-certs".to_string(),
                        mount_path: "/etc/ssl/certs".to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: "secrets".to_string(),
                        mount_path: "/etc/kubernetes/secrets".to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }],
            host_network: Some(true),
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                run_as_user: Some(65534),
                ..Default::default()
            }),
            volumes: Some(vec![
                Volume {
                    name: "ssl-certs".to_string(),
                    host_path: Some(HostPathVolumeSource {
                        path: "/etc/ssl/certs".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "secrets".to_string(),
                    host_path: Some(HostPathVolumeSource {
                        path: "/etc/kubernetes/secrets".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    fn test_config() -> config::ApiServerConfig {
        config::ApiServerConfig {
            image: "k8s.gcr.io/kube-apiserver:v1.20.2".to_string(),
            control_plane_endpoint: "https://cp:6443".to_string(),
            etcd_servers: vec!["https://127.0.0.1:2379".to_string()],
            local_port: 6443,
            service_cidr: "10.96.0.0/12".to_string(),
            extra_args: BTreeMap::new(),
        }
    }

    fn command(pod: &Pod) -> Vec<String> {
        pod.spec.as_ref().unwrap().containers[0]
            .command
            .clone()
            .unwrap()
    }

    #[test]
    fn renders_configured_flags() {
        let pod = build_api_server_pod(&test_config());
        let command = command(&pod);

        assert!(command.contains(&"--secure-port=6443".to_string()));
        assert!(command.contains(&"--etcd-servers=https://127.0.0.1:2379".to_string()));
        assert!(command.contains(&"--service-cluster-ip-range=10.96.0.0/12".to_string()));
        assert!(command.contains(&"--api-audiences=https://cp:6443".to_string()));
        assert_eq!(
            pod.spec.as_ref().unwrap().containers[0].image.as_deref(),
            Some("k8s.gcr.io/kube-apiserver:v1.20.2")
        );
    }

    #[test]
    fn extra_args_are_appended_sorted_by_key() {
        let mut cfg = test_config();
        cfg.extra_args
            .insert("feature-gates".to_string(), "AllBeta=true".to_string());
        cfg.extra_args
            .insert("audit-log-format".to_string(), "json".to_string());

        let command = command(&build_api_server_pod(&cfg));
        let audit = command
            .iter()
            .position(|arg| arg == "--audit-log-format=json")
            .unwrap();
        let gates = command
            .iter()
            .position(|arg| arg == "--feature-gates=AllBeta=true")
            .unwrap();

        assert!(audit < gates);
        assert!(audit > command.len() - 3, "extra args go at the end");
    }

    #[test]
    fn missing_optional_fields_render_as_empty_values() {
        let mut cfg = test_config();
        cfg.service_cidr = String::new();

        let command = command(&build_api_server_pod(&cfg));
        assert!(command.contains(&"--service-cluster-ip-range=".to_string()));
    }

    #[test]
    fn pod_runs_unprivileged_on_the_host_network() {
        let pod = build_api_server_pod(&test_config());
        let spec = pod.spec.as_ref().unwrap();

        assert_eq!(spec.host_network, Some(true));
        let security = spec.security_context.as_ref().unwrap();
        assert_eq!(security.run_as_non_root, Some(true));
        assert_eq!(security.run_as_user, Some(65534));

        let mounts = spec.containers[0].volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().all(|m| m.read_only == Some(true)));
    }

    #[test]
    fn rendering_is_deterministic() {
        let mut cfg = test_config();
        cfg.extra_args
            .insert("feature-gates".to_string(), "AllBeta=true".to_string());

        let first = serde_yaml::to_string(&build_api_server_pod(&cfg)).unwrap();
        let second = serde_yaml::to_string(&build_api_server_pod(&cfg)).unwrap();
        assert_eq!(first, second);
    }
}
