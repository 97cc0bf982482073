use anyhow::Context;
use async_trait::async_trait;
use rudder_runtime::{Controller, ControllerContext, Dependency};
use rudder_state::constants;
use rudder_state::resources::config;

/// Projects the machine configuration into per-component control plane
/// configuration resources (currently only the API server).
pub struct K8sControlPlaneController;

#[async_trait]
impl Controller for K8sControlPlaneController {
    fn name(&self) -> &'static str {
        "config.K8sControlPlaneController"
    }

    fn outputs(&self) -> (&str, &str) {
        (config::NAMESPACE, config::K8S_CONTROL_PLANE_TYPE)
    }

    async fn run(&self, ctx: &mut ControllerContext) -> anyhow::Result<()> {
        ctx.update_dependencies(vec![Dependency::weak(
            config::NAMESPACE,
            config::MACHINE_CONFIG_TYPE,
        )
        .with_id(config::MACHINE_CONFIG_ID)])
        .await?;

        let shutdown = ctx.shutdown();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = ctx.event() => {}
            }

            let machine_config = match ctx
                .get(
                    config::NAMESPACE,
                    config::MACHINE_CONFIG_TYPE,
                    config::MACHINE_CONFIG_ID,
                )
                .await
            {
                Ok(resource) => resource,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err).context("error getting machine config"),
            };

            let machine_config = machine_config
                .spec()
                .as_machine_config()
                .context("unexpected spec on machine config resource")?;

            ctx.modify(config::new_api_server_config(config::ApiServerConfig {
                image: machine_config.api_server_image(),
                control_plane_endpoint: machine_config.control_plane_endpoint().to_string(),
                // Every control plane node runs a local etcd member.
                etcd_servers: vec![constants::LOCAL_ETCD_SERVER.to_string()],
                local_port: machine_config.local_api_server_port(),
                service_cidr: machine_config.service_cidr().to_string(),
                extra_args: machine_config.api_server_extra_args(),
            }))
            .await?;
        }
    }
}
