//! Self-describing resources: the registry of namespaces and resource
//! definitions lives in the store itself, under a reserved namespace.

use serde::{Deserialize, Serialize};

use crate::{Metadata, Resource, Spec};

/// Reserved namespace holding the registry.
pub const NAMESPACE: &str = "meta";

/// Type of resource definition resources.
pub const RESOURCE_DEFINITION_TYPE: &str = "meta/resourceDefinition";

/// Type of namespace resources.
pub const NAMESPACE_TYPE: &str = "meta/namespace";

/// Declares a resource type: its canonical name, the aliases it resolves
/// from, and the namespace used when a caller doesn't name one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinitionSpec {
    #[serde(rename = "type")]
    pub ty: String,
    pub aliases: Vec<String>,
    pub default_namespace: String,
}

/// Declares a namespace resources may live in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSpec {
    pub description: String,
}

/// Builds a resource definition resource; the id is the canonical type name.
pub fn new_resource_definition(spec: ResourceDefinitionSpec) -> Resource {
    Resource::new(
        Metadata::new(NAMESPACE, RESOURCE_DEFINITION_TYPE, spec.ty.clone()),
        Spec::ResourceDefinition(spec),
    )
}

/// Builds a namespace resource.
pub fn new_namespace(name: impl Into<String>, description: impl Into<String>) -> Resource {
    Resource::new(
        Metadata::new(NAMESPACE, NAMESPACE_TYPE, name),
        Spec::Namespace(NamespaceSpec {
            description: description.into(),
        }),
    )
}
