//! TLS material for the API router, loaded from PEM files produced by the
//! node's PKI provider.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio_rustls::rustls::server::AllowAnyAuthenticatedClient;
use tokio_rustls::rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig};

fn load_certs(path: &Path) -> anyhow::Result<Vec<Certificate>> {
    let file = File::open(path)
        .with_context(|| format!("error opening certificate {}", path.display()))?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(file))?;

    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }

    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKey> {
    let file =
        File::open(path).with_context(|| format!("error opening key {}", path.display()))?;

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(file))?;

    if keys.is_empty() {
        bail!("no PKCS#8 private keys found in {}", path.display());
    }

    Ok(PrivateKey(keys.remove(0)))
}

fn load_roots(path: &Path) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    for cert in load_certs(path)? {
        roots
            .add(&cert)
            .with_context(|| format!("error adding root from {}", path.display()))?;
    }

    Ok(roots)
}

/// Server-side configuration: clients must present a certificate signed by
/// the CA.
pub fn server_config(cert: &Path, key: &Path, ca: &Path) -> anyhow::Result<Arc<ServerConfig>> {
    let verifier = AllowAnyAuthenticatedClient::new(load_roots(ca)?).boxed();

    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(cert)?, load_key(key)?)
        .context("error building server TLS configuration")?;

    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(Arc::new(config))
}

/// Client-side configuration presenting our certificate; shared across every
/// pooled connection to remote nodes.
pub fn client_config(cert: &Path, key: &Path, ca: &Path) -> anyhow::Result<Arc<ClientConfig>> {
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(load_roots(ca)?)
        .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
        .context("error building client TLS configuration")?;

    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(Arc::new(config))
}
