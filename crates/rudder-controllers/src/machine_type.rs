use anyhow::Context;
use async_trait::async_trait;
use rudder_runtime::{Controller, ControllerContext, Dependency};
use rudder_state::resources::config;

/// Classifies the machine from its configuration document.
///
/// The rest of the control plane pipeline keys off the derived
/// `config/machineType` singleton instead of re-reading the full document.
pub struct MachineTypeController;

#[async_trait]
impl Controller for MachineTypeController {
    fn name(&self) -> &'static str {
        "config.MachineTypeController"
    }

    fn outputs(&self) -> (&str, &str) {
        (config::NAMESPACE, config::MACHINE_TYPE_TYPE)
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

            let machine_type = machine_config
                .spec()
                .as_machine_config()
                .context("unexpected spec on machine config resource")?
                .machine_type();

            ctx.modify(config::new_machine_type(machine_type)).await?;
        }
    }
}
