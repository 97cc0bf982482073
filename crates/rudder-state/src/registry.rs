//! Registration of namespaces and resource definitions.
//!
//! Both live in the store itself under the reserved `meta` namespace;
//! registration is just a create that tolerates repetition.

use crate::error::Error;
use crate::resources::{config, k8s, legacy, meta};
use crate::state::State;

/// Registers a namespace, succeeding if it is already registered.
pub async fn register_namespace(
    state: &State,
    name: &str,
    description: &str,
) -> Result<(), Error> {
    match state.create(meta::new_namespace(name, description)).await {
        Ok(_) => Ok(()),
        Err(err) if err.is_already_exists() => Ok(()),
        Err(err) => Err(err),
    }
}

/// Registers a resource definition, succeeding if it is already registered.
pub async fn register_definition(
    state: &State,
    spec: meta::ResourceDefinitionSpec,
) -> Result<(), Error> {
    match state.create(meta::new_resource_definition(spec)).await {
        Ok(_) => Ok(()),
        Err(err) if err.is_already_exists() => Ok(()),
        Err(err) => Err(err),
    }
}

/// Registers every namespace and resource definition the node runtime uses.
pub async fn register_defaults(state: &State) -> Result<(), Error> {
    for (name, description) in [
        (config::NAMESPACE, "machine configuration"),
        (k8s::NAMESPACE, "Kubernetes control plane"),
        (legacy::NAMESPACE, "legacy service subsystem"),
    ] {
        register_namespace(state, name, description).await?;
    }

    for definition in config::definitions()
        .into_iter()
        .chain(k8s::definitions())
        .chain(legacy::definitions())
    {
        register_definition(state, definition).await?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn register_defaults_is_idempotent() {
        let state = State::new();

        register_defaults(&state).await.unwrap();
        register_defaults(&state).await.unwrap();

        let definitions = state
            .list(meta::NAMESPACE, meta::RESOURCE_DEFINITION_TYPE)
            .await
            .unwrap();
        assert!(definitions
            .iter()
            .any(|d| d.metadata().id() == config::MACHINE_TYPE_TYPE));
    }
}
