//! Well-known paths, ports and defaults shared across the node runtime.
//!
//! Anything that lands on the filesystem is expressed relative to a root
//! directory so tests can redirect the whole tree with a tempdir.

use std::path::{Path, PathBuf};

/// Directory the kubelet polls for static pod manifests.
pub const MANIFESTS_DIRECTORY: &str = "/etc/kubernetes/manifests";

/// Directory holding control plane secrets, mounted read-only into static pods.
pub const SECRETS_DIRECTORY: &str = "/etc/kubernetes/secrets";

/// TCP port the API router listens on.
pub const APID_PORT: u16 = 50000;

/// Default kube-apiserver secure port when the machine config doesn't set one.
pub const DEFAULT_SECURE_PORT: u16 = 6443;

/// Default control plane version used when the machine config omits an image.
pub const DEFAULT_KUBERNETES_VERSION: &str = "1.20.2";

/// Image repository for the kube-apiserver static pod.
pub const KUBERNETES_APISERVER_IMAGE: &str = "k8s.gcr.io/kube-apiserver";

/// Every node runs its own etcd member, so the apiserver always dials loopback.
pub const LOCAL_ETCD_SERVER: &str = "https://127.0.0.1:2379";

fn rooted(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

/// The static pod manifests directory under the given root.
pub fn manifests_directory(root: &Path) -> PathBuf {
    rooted(root, MANIFESTS_DIRECTORY)
}

/// UNIX socket the node daemon serves its gRPC API on.
pub fn rudderd_socket_path(root: &Path) -> PathBuf {
    rooted(root, "/system/run/rudderd/rudderd.sock")
}

/// Local, non-TLS UNIX socket of the API router.
pub fn apid_socket_path(root: &Path) -> PathBuf {
    rooted(root, "/system/run/apid/apid.sock")
}
