//! The node daemon: loads the machine configuration, reconciles it into
//! static pod manifests through the controller runtime, and serves the
//! resource API on the local socket.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use rudder_controllers::{
    ControlPlaneStaticPodController, K8sControlPlaneController, KubeletStaticPodController,
    MachineTypeController, ServiceController, ServiceEvents,
};
use rudder_runtime::Runtime;
use rudder_state::resources::config;
use rudder_state::{constants, registry, State};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rudderd", about = "Node runtime daemon")]
struct Opts {
    /// Machine configuration document; read from standard input when omitted.
    #[arg(long = "config", env = "RUDDER_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory for sockets and manifests.
    #[arg(long = "root", env = "RUDDER_ROOT", default_value = "/")]
    root: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run(Opts::parse()).await {
        eprintln!("rudderd: {:#}", err);
        std::process::exit(1);
    }
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    let machine_config = config::MachineConfig::load(opts.config.as_deref())
        .context("error loading machine configuration")?;

    let state = State::new();
    registry::register_defaults(&state)
        .await
        .context("error registering resource definitions")?;

    state
        .create(config::new_machine_config(machine_config))
        .await
        .context("error publishing machine configuration")?;

    // The init subsystem publishes service lifecycle transitions here; the
    // service controller mirrors them into the store.
    let events = ServiceEvents::new();

    let mut runtime = Runtime::new(state.clone());
    runtime.register(ServiceController::new(events.clone()))?;
    runtime.register(MachineTypeController)?;
    runtime.register(K8sControlPlaneController)?;
    runtime.register(ControlPlaneStaticPodController)?;
    runtime.register(KubeletStaticPodController::new(
        constants::manifests_directory(&opts.root),
    ))?;

    let shutdown = CancellationToken::new();

    let mut api = tokio::spawn(rudder_api::server::serve(
        state.clone(),
        constants::rudderd_socket_path(&opts.root),
        shutdown.clone(),
    ));
    let mut controllers = tokio::spawn(runtime.run(shutdown.clone()));

    info!("rudderd started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        result = &mut api => {
            return result?.context("resource API server failed");
        }
        result = &mut controllers => {
            return result?.context("controller runtime failed");
        }
    }

    shutdown.cancel();

    controllers.await??;
    api.await??;

    Ok(())
}
