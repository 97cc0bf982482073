//! Kubernetes control plane resources: static pod definitions and their
//! rendered status.

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

use crate::resources::meta::ResourceDefinitionSpec;
use crate::{Metadata, Resource, Spec};

/// Namespace holding control plane resources.
pub const NAMESPACE: &str = "k8s";

/// Type of static pod definition resources.
pub const STATIC_POD_TYPE: &str = "k8s/staticPod";

/// Type of static pod status resources.
pub const STATIC_POD_STATUS_TYPE: &str = "k8s/staticPodStatus";

/// Status of a rendered static pod manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticPodStatus {
    pub running: bool,
}

/// Builds a static pod resource holding a full pod document.
pub fn new_static_pod(id: impl Into<String>, pod: Pod) -> Resource {
    Resource::new(
        Metadata::new(NAMESPACE, STATIC_POD_TYPE, id),
        Spec::StaticPod(Box::new(pod)),
    )
}

/// Builds a static pod status resource.
pub fn new_static_pod_status(id: impl Into<String>, running: bool) -> Resource {
    Resource::new(
        Metadata::new(NAMESPACE, STATIC_POD_STATUS_TYPE, id),
        Spec::StaticPodStatus(StaticPodStatus { running }),
    )
}

/// String form of a static pod status resource, used as the finalizer the
/// manifest renderer places on the static pod it renders.
pub fn static_pod_status_finalizer(namespace: &str, id: &str) -> String {
    format!("{}/k8s.StaticPodStatus/{}", namespace, id)
}

pub fn definitions() -> Vec<ResourceDefinitionSpec> {
    vec![
        ResourceDefinitionSpec {
            ty: STATIC_POD_TYPE.to_string(),
            aliases: vec!["staticPod".to_string()],
            default_namespace: NAMESPACE.to_string(),
        },
        ResourceDefinitionSpec {
            ty: STATIC_POD_STATUS_TYPE.to_string(),
            aliases: vec!["podStatus".to_string()],
            default_namespace: NAMESPACE.to_string(),
        },
    ]
}
