use k8s_openapi::api::core::v1::Pod;

use crate::resources::config::{ApiServerConfig, MachineConfig, MachineType};
use crate::resources::k8s::StaticPodStatus;
use crate::resources::legacy::Service;
use crate::resources::meta::{NamespaceSpec, ResourceDefinitionSpec};

/// Dynamic-typed resource payload.
///
/// One variant per known resource type, plus [`Spec::Raw`] as the escape
/// hatch for payloads we merely transport. Consumers assert the case they
/// expect through the `as_*` accessors and treat a mismatch as a bug.
#[derive(Debug, Clone, PartialEq)]
pub enum Spec {
    MachineConfig(Box<MachineConfig>),
    MachineType(MachineType),
    ApiServer(ApiServerConfig),
    StaticPod(Box<Pod>),
    StaticPodStatus(StaticPodStatus),
    Service(Service),
    ResourceDefinition(ResourceDefinitionSpec),
    Namespace(NamespaceSpec),
    Raw(String),
}

impl Spec {
    /// Serializes the payload (not the variant tag) to YAML for transport.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        match self {
            Spec::MachineConfig(config) => serde_yaml::to_string(config),
            Spec::MachineType(machine_type) => serde_yaml::to_string(machine_type),
            Spec::ApiServer(api_server) => serde_yaml::to_string(api_server),
            Spec::StaticPod(pod) => serde_yaml::to_string(pod),
            Spec::StaticPodStatus(status) => serde_yaml::to_string(status),
            Spec::Service(service) => serde_yaml::to_string(service),
            Spec::ResourceDefinition(definition) => serde_yaml::to_string(definition),
            Spec::Namespace(namespace) => serde_yaml::to_string(namespace),
            Spec::Raw(yaml) => Ok(yaml.clone()),
        }
    }

    pub fn as_machine_config(&self) -> Option<&MachineConfig> {
        match self {
            Spec::MachineConfig(config) => Some(config),
            _ => None,
        }
    }

    pub fn as_machine_type(&self) -> Option<MachineType> {
        match self {
            Spec::MachineType(machine_type) => Some(*machine_type),
            _ => None,
        }
    }

    pub fn as_api_server(&self) -> Option<&ApiServerConfig> {
        match self {
            Spec::ApiServer(api_server) => Some(api_server),
            _ => None,
        }
    }

    pub fn as_static_pod(&self) -> Option<&Pod> {
        match self {
            Spec::StaticPod(pod) => Some(pod),
            _ => None,
        }
    }

    pub fn as_static_pod_status(&self) -> Option<&StaticPodStatus> {
        match self {
            Spec::StaticPodStatus(status) => Some(status),
            _ => None,
        }
    }

    pub fn as_service(&self) -> Option<&Service> {
        match self {
            Spec::Service(service) => Some(service),
            _ => None,
        }
    }

    pub fn as_resource_definition(&self) -> Option<&ResourceDefinitionSpec> {
        match self {
            Spec::ResourceDefinition(definition) => Some(definition),
            _ => None,
        }
    }
}
