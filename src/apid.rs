//! The API router: terminates TLS on the node's public port, serves the
//! local unauthenticated socket, and forwards gRPC calls transparently to
//! the node daemon or to remote nodes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rudder_api::router::{serve_tls, serve_unix, Router};
use rudder_api::tls;
use rudder_state::constants;
use tokio::net::{TcpListener, UnixListener};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "apid", about = "Node API router")]
struct Opts {
    /// Comma-separated control plane node addresses: the fan-out set for
    /// aggregated calls that don't name their nodes.
    #[arg(long = "endpoints", env = "RUDDER_ENDPOINTS", value_delimiter = ',')]
    endpoints: Vec<String>,

    /// PEM certificate presented on the public port and to remote nodes.
    #[arg(long = "cert", env = "RUDDER_CERT")]
    cert: PathBuf,

    /// PEM private key for the certificate.
    #[arg(long = "key", env = "RUDDER_KEY")]
    key: PathBuf,

    /// PEM CA bundle clients and remote nodes must chain to.
    #[arg(long = "ca", env = "RUDDER_CA")]
    ca: PathBuf,

    /// Port to listen on for external clients.
    #[arg(long = "port", env = "RUDDER_PORT", default_value_t = constants::APID_PORT)]
    port: u16,

    /// Root directory for sockets.
    #[arg(long = "root", env = "RUDDER_ROOT", default_value = "/")]
    root: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run(Opts::parse()).await {
        eprintln!("apid: {:#}", err);
        std::process::exit(1);
    }
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    let server_tls = tls::server_config(&opts.cert, &opts.key, &opts.ca)
        .context("error building server TLS configuration")?;
    let client_tls = tls::client_config(&opts.cert, &opts.key, &opts.ca)
        .context("error building client TLS configuration")?;

    if !opts.endpoints.is_empty() {
        info!(endpoints = ?opts.endpoints, "control plane endpoints");
    }

    let router = Arc::new(Router::new(
        constants::rudderd_socket_path(&opts.root),
        Some(client_tls),
        opts.endpoints.clone(),
    ));

    let shutdown = CancellationToken::new();

    let listener = TcpListener::bind(("0.0.0.0", opts.port))
        .await
        .with_context(|| format!("error binding port {}", opts.port))?;
    let mut public = tokio::spawn(serve_tls(
        router.clone(),
        listener,
        TlsAcceptor::from(server_tls),
        shutdown.clone(),
    ));

    let socket = constants::apid_socket_path(&opts.root);
    if let Some(parent) = socket.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::remove_file(&socket).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).context("error removing stale socket"),
    }
    let listener = UnixListener::bind(&socket)
        .with_context(|| format!("error binding {}", socket.display()))?;
    let mut local = tokio::spawn(serve_unix(router, listener, shutdown.clone()));

    info!(port = opts.port, socket = %socket.display(), "apid started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        result = &mut public => {
            return result?.context("public listener failed");
        }
        result = &mut local => {
            return result?.context("local listener failed");
        }
    }

    shutdown.cancel();

    public.await??;
    local.await??;

    Ok(())
}
