//! Machine configuration resources: the raw user-supplied document and the
//! control plane configuration derived from it.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::resources::meta::ResourceDefinitionSpec;
use crate::{Metadata, Resource, Spec};

/// Namespace holding configuration resources.
pub const NAMESPACE: &str = "config";

/// Type of the machine configuration document resource.
pub const MACHINE_CONFIG_TYPE: &str = "config/v1alpha1";

/// Singleton id of the machine configuration document.
pub const MACHINE_CONFIG_ID: &str = "v1alpha1";

/// Type of the derived machine type resource.
pub const MACHINE_TYPE_TYPE: &str = "config/machineType";

/// Singleton id of the machine type resource.
pub const MACHINE_TYPE_ID: &str = "machine-type";

/// Type of the derived control plane component configuration.
pub const K8S_CONTROL_PLANE_TYPE: &str = "config/k8sControlPlane";

/// Control plane component id for the API server.
pub const API_SERVER_ID: &str = "kube-apiserver";

/// The role this machine plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    Init,
    ControlPlane,
    Worker,
}

impl MachineType {
    /// Init nodes run the control plane too.
    pub fn is_control_plane(&self) -> bool {
        matches!(self, MachineType::Init | MachineType::ControlPlane)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineType::Init => "init",
            MachineType::ControlPlane => "controlplane",
            MachineType::Worker => "worker",
        }
    }
}

impl Default for MachineType {
    fn default() -> Self {
        MachineType::Worker
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user-supplied machine configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MachineConfig {
    pub machine: MachineSection,
    pub cluster: ClusterSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSection {
    #[serde(rename = "type")]
    pub machine_type: MachineType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterSection {
    pub control_plane: ControlPlaneSection,
    pub api_server: ApiServerSection,
    pub network: NetworkSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControlPlaneSection {
    pub endpoint: String,
    pub local_api_server_port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiServerSection {
    pub image: String,
    pub extra_args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkSection {
    pub service_subnets: Vec<String>,
}

impl MachineConfig {
    pub fn from_yaml(document: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(document)
    }

    /// Loads the configuration document from a file, or from standard input
    /// when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let document = match path {
            Some(path) => std::fs::read_to_string(path)?,
            None => {
                let mut document = String::new();
                std::io::stdin().read_to_string(&mut document)?;
                document
            }
        };

        Ok(Self::from_yaml(&document)?)
    }

    pub fn machine_type(&self) -> MachineType {
        self.machine.machine_type
    }

    pub fn control_plane_endpoint(&self) -> &str {
        &self.cluster.control_plane.endpoint
    }

    pub fn local_api_server_port(&self) -> u16 {
        self.cluster
            .control_plane
            .local_api_server_port
            .unwrap_or(constants::DEFAULT_SECURE_PORT)
    }

    /// First configured service subnet; empty when the config doesn't set one.
    pub fn service_cidr(&self) -> &str {
        self.cluster
            .network
            .service_subnets
            .first()
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn api_server_image(&self) -> String {
        if self.cluster.api_server.image.is_empty() {
            format!(
                "{}:v{}",
                constants::KUBERNETES_APISERVER_IMAGE,
                constants::DEFAULT_KUBERNETES_VERSION
            )
        } else {
            self.cluster.api_server.image.clone()
        }
    }

    pub fn api_server_extra_args(&self) -> BTreeMap<String, String> {
        self.cluster.api_server.extra_args.clone()
    }
}

/// Configuration for one control plane component, projected out of the
/// machine configuration by the control plane config controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiServerConfig {
    pub image: String,
    pub control_plane_endpoint: String,
    pub etcd_servers: Vec<String>,
    pub local_port: u16,
    #[serde(rename = "serviceCIDR")]
    pub service_cidr: String,
    pub extra_args: BTreeMap<String, String>,
}

/// Builds the singleton machine configuration resource.
pub fn new_machine_config(config: MachineConfig) -> Resource {
    Resource::new(
        Metadata::new(NAMESPACE, MACHINE_CONFIG_TYPE, MACHINE_CONFIG_ID),
        Spec::MachineConfig(Box::new(config)),
    )
}

/// Builds the singleton machine type resource.
pub fn new_machine_type(machine_type: MachineType) -> Resource {
    Resource::new(
        Metadata::new(NAMESPACE, MACHINE_TYPE_TYPE, MACHINE_TYPE_ID),
        Spec::MachineType(machine_type),
    )
}

/// Builds a control plane component configuration resource.
pub fn new_api_server_config(spec: ApiServerConfig) -> Resource {
    Resource::new(
        Metadata::new(NAMESPACE, K8S_CONTROL_PLANE_TYPE, API_SERVER_ID),
        Spec::ApiServer(spec),
    )
}

pub fn definitions() -> Vec<ResourceDefinitionSpec> {
    vec![
        ResourceDefinitionSpec {
            ty: MACHINE_CONFIG_TYPE.to_string(),
            aliases: vec!["machineconfig".to_string()],
            default_namespace: NAMESPACE.to_string(),
        },
        ResourceDefinitionSpec {
            ty: MACHINE_TYPE_TYPE.to_string(),
            aliases: vec!["machineType".to_string()],
            default_namespace: NAMESPACE.to_string(),
        },
        ResourceDefinitionSpec {
            ty: K8S_CONTROL_PLANE_TYPE.to_string(),
            aliases: vec!["controlPlane".to_string()],
            default_namespace: NAMESPACE.to_string(),
        },
    ]
}
