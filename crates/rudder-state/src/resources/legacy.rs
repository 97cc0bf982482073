//! Glue resources reflecting the legacy service subsystem into the store.

use serde::{Deserialize, Serialize};

use crate::resources::meta::ResourceDefinitionSpec;
use crate::{Metadata, Resource, Spec};

/// Namespace linking legacy subsystems with the resource runtime.
pub const NAMESPACE: &str = "legacy";

/// Type of service state resources.
pub const SERVICE_TYPE: &str = "legacy/service";

/// Well-known id of the kubelet service.
pub const KUBELET_SERVICE_ID: &str = "kubelet";

/// State of one supervised system service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub running: bool,
}

/// Builds a service state resource.
pub fn new_service(id: impl Into<String>, running: bool) -> Resource {
    Resource::new(
        Metadata::new(NAMESPACE, SERVICE_TYPE, id),
        Spec::Service(Service { running }),
    )
}

pub fn definitions() -> Vec<ResourceDefinitionSpec> {
    vec![ResourceDefinitionSpec {
        ty: SERVICE_TYPE.to_string(),
        aliases: vec!["service".to_string()],
        default_namespace: NAMESPACE.to_string(),
    }]
}
