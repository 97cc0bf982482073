use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::error::Error;
use crate::resource::{Phase, Query, Resource, Version};
use crate::resources::meta;

/// What happened to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Replay of a resource that already existed when the watch was opened.
    Bootstrap,
    Created,
    Updated,
    Destroyed,
}

/// A change notification delivered to watchers.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub resource: Resource,
}

struct Watcher {
    query: Query,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct Inner {
    // (namespace, type) -> id-ordered resources
    collections: HashMap<(String, String), BTreeMap<String, Resource>>,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn collection(&self, namespace: &str, ty: &str) -> Option<&BTreeMap<String, Resource>> {
        self.collections
            .get(&(namespace.to_string(), ty.to_string()))
    }

    fn collection_mut(&mut self, namespace: &str, ty: &str) -> &mut BTreeMap<String, Resource> {
        self.collections
            .entry((namespace.to_string(), ty.to_string()))
            .or_default()
    }

    fn is_namespace_registered(&self, namespace: &str) -> bool {
        self.collection(meta::NAMESPACE, meta::NAMESPACE_TYPE)
            .map(|namespaces| namespaces.contains_key(namespace))
            .unwrap_or(false)
    }

    fn is_type_registered(&self, ty: &str) -> bool {
        self.collection(meta::NAMESPACE, meta::RESOURCE_DEFINITION_TYPE)
            .map(|definitions| definitions.contains_key(ty))
            .unwrap_or(false)
    }

    fn check_registered(&self, namespace: &str, ty: &str) -> Result<(), Error> {
        if !self.is_namespace_registered(namespace) {
            return Err(Error::UnknownNamespace(namespace.to_string()));
        }

        if !self.is_type_registered(ty) {
            return Err(Error::UnknownType(ty.to_string()));
        }

        Ok(())
    }

    fn get(&self, namespace: &str, ty: &str, id: &str) -> Result<&Resource, Error> {
        self.check_registered(namespace, ty)?;

        self.collection(namespace, ty)
            .and_then(|resources| resources.get(id))
            .ok_or_else(|| Error::not_found(namespace, ty, id))
    }

    fn get_mut(&mut self, namespace: &str, ty: &str, id: &str) -> Result<&mut Resource, Error> {
        self.check_registered(namespace, ty)?;

        self.collections
            .get_mut(&(namespace.to_string(), ty.to_string()))
            .and_then(|resources| resources.get_mut(id))
            .ok_or_else(|| Error::not_found(namespace, ty, id))
    }

    /// Delivers an event to every watcher whose query matches, dropping
    /// watchers whose receiver has gone away.
    fn dispatch(&mut self, kind: EventKind, resource: &Resource) {
        trace!(kind = ?kind, resource = %resource.metadata(), "dispatching event");

        self.watchers.retain(|watcher| {
            if !watcher.query.matches(resource.metadata()) {
                return true;
            }

            watcher
                .tx
                .send(Event {
                    kind,
                    resource: resource.clone(),
                })
                .is_ok()
        });
    }

    fn insert_bootstrap(&mut self, mut resource: Resource) {
        resource.metadata_mut().set_version(Version::first());
        let key = resource.metadata().id().to_string();
        self.collection_mut(resource.metadata().namespace(), resource.metadata().ty())
            .insert(key, resource);
    }
}

/// The process-wide resource store.
///
/// Cheap to clone; all clones share the same underlying maps. A single
/// coarse lock serializes every operation, so readers always observe a
/// consistent point-in-time snapshot and watch events are delivered in
/// mutation order.
#[derive(Clone)]
pub struct State {
    inner: Arc<Mutex<Inner>>,
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}

impl State {
    /// Creates an empty store with the reserved `meta` namespace and its
    /// self-describing definitions installed, so that every resource ever
    /// stored references a registered namespace and type.
    pub fn new() -> Self {
        let mut inner = Inner::default();

        inner.insert_bootstrap(meta::new_namespace(
            meta::NAMESPACE,
            "self-describing resource metadata",
        ));
        inner.insert_bootstrap(meta::new_resource_definition(
            meta::ResourceDefinitionSpec {
                ty: meta::RESOURCE_DEFINITION_TYPE.to_string(),
                aliases: vec!["resourceDefinition".to_string()],
                default_namespace: meta::NAMESPACE.to_string(),
            },
        ));
        inner.insert_bootstrap(meta::new_resource_definition(
            meta::ResourceDefinitionSpec {
                ty: meta::NAMESPACE_TYPE.to_string(),
                aliases: vec!["namespace".to_string()],
                default_namespace: meta::NAMESPACE.to_string(),
            },
        ));

        State {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Fetches a single resource.
    pub async fn get(&self, namespace: &str, ty: &str, id: &str) -> Result<Resource, Error> {
        let inner = self.inner.lock().await;

        inner.get(namespace, ty, id).cloned()
    }

    /// Lists every resource of a kind, ordered by id.
    pub async fn list(&self, namespace: &str, ty: &str) -> Result<Vec<Resource>, Error> {
        let inner = self.inner.lock().await;

        inner.check_registered(namespace, ty)?;

        Ok(inner
            .collection(namespace, ty)
            .map(|resources| resources.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Stores a new resource at version 1, phase running.
    pub async fn create(&self, mut resource: Resource) -> Result<Resource, Error> {
        let mut inner = self.inner.lock().await;

        let (namespace, ty, id) = (
            resource.metadata().namespace().to_string(),
            resource.metadata().ty().to_string(),
            resource.metadata().id().to_string(),
        );

        inner.check_registered(&namespace, &ty)?;

        if inner
            .collection(&namespace, &ty)
            .map(|resources| resources.contains_key(&id))
            .unwrap_or(false)
        {
            return Err(Error::already_exists(&namespace, &ty, &id));
        }

        resource.metadata_mut().set_version(Version::first());
        resource.metadata_mut().set_phase(Phase::Running);

        inner
            .collection_mut(&namespace, &ty)
            .insert(id, resource.clone());
        inner.dispatch(EventKind::Created, &resource);

        Ok(resource)
    }

    /// Replaces the spec of an existing resource.
    ///
    /// The caller passes the version it last observed; a mismatch fails with
    /// a conflict so the caller can re-read and retry. Resources that are
    /// tearing down reject spec updates.
    pub async fn update(
        &self,
        previous: Version,
        resource: Resource,
    ) -> Result<Resource, Error> {
        let mut inner = self.inner.lock().await;

        let (namespace, ty, id) = (
            resource.metadata().namespace().to_string(),
            resource.metadata().ty().to_string(),
            resource.metadata().id().to_string(),
        );

        let stored = inner.get_mut(&namespace, &ty, &id)?;

        if stored.metadata().version() != previous {
            let reason = format!(
                "expected version {}, found {}",
                previous,
                stored.metadata().version()
            );

            return Err(Error::conflict(&namespace, &ty, &id, reason));
        }

        if stored.metadata().phase() == Phase::TearingDown {
            return Err(Error::conflict(&namespace, &ty, &id, "resource is tearing down"));
        }

        stored.set_spec(resource.spec().clone());
        let next = stored.metadata().version().next();
        stored.metadata_mut().set_version(next);

        let updated = stored.clone();
        inner.dispatch(EventKind::Updated, &updated);

        Ok(updated)
    }

    /// Idempotent upsert: creates the resource if missing, replaces its spec
    /// if it changed, and leaves the store untouched (version included) when
    /// the desired spec equals the stored one.
    pub async fn modify(&self, mut resource: Resource) -> Result<Resource, Error> {
        let mut inner = self.inner.lock().await;

        let (namespace, ty, id) = (
            resource.metadata().namespace().to_string(),
            resource.metadata().ty().to_string(),
            resource.metadata().id().to_string(),
        );

        inner.check_registered(&namespace, &ty)?;

        let existing = inner
            .collection(&namespace, &ty)
            .and_then(|resources| resources.get(&id))
            .cloned();

        match existing {
            None => {
                resource.metadata_mut().set_version(Version::first());
                resource.metadata_mut().set_phase(Phase::Running);

                inner
                    .collection_mut(&namespace, &ty)
                    .insert(id, resource.clone());
                inner.dispatch(EventKind::Created, &resource);

                Ok(resource)
            }
            Some(stored) if stored.spec() == resource.spec() => Ok(stored),
            Some(stored) => {
                if stored.metadata().phase() == Phase::TearingDown {
                    return Err(Error::conflict(
                        &namespace,
                        &ty,
                        &id,
                        "resource is tearing down",
                    ));
                }

                let updated = {
                    let slot = inner.get_mut(&namespace, &ty, &id)?;
                    slot.set_spec(resource.spec().clone());
                    let next = slot.metadata().version().next();
                    slot.metadata_mut().set_version(next);
                    slot.clone()
                };

                inner.dispatch(EventKind::Updated, &updated);

                Ok(updated)
            }
        }
    }

    /// Marks a resource as tearing down, returning whether it can be
    /// destroyed right away (i.e. no finalizers are attached). Callers that
    /// get `false` wait for the owners of the finalizers to release them.
    pub async fn teardown(&self, namespace: &str, ty: &str, id: &str) -> Result<bool, Error> {
        let mut inner = self.inner.lock().await;

        let updated = {
            let stored = inner.get_mut(namespace, ty, id)?;

            if stored.metadata().phase() == Phase::TearingDown {
                return Ok(stored.metadata().finalizers().is_empty());
            }

            stored.metadata_mut().set_phase(Phase::TearingDown);
            let next = stored.metadata().version().next();
            stored.metadata_mut().set_version(next);
            stored.clone()
        };

        let ready = updated.metadata().finalizers().is_empty();
        inner.dispatch(EventKind::Updated, &updated);

        Ok(ready)
    }

    /// Removes a resource from the store. Fails while finalizers remain.
    pub async fn destroy(&self, namespace: &str, ty: &str, id: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;

        {
            let stored = inner.get(namespace, ty, id)?;

            if !stored.metadata().finalizers().is_empty() {
                return Err(Error::has_finalizers(namespace, ty, id));
            }
        }

        let removed = inner
            .collection_mut(namespace, ty)
            .remove(id)
            .expect("checked above");

        inner.dispatch(EventKind::Destroyed, &removed);

        Ok(())
    }

    /// Attaches a finalizer. A no-op (and no event) if already present.
    pub async fn add_finalizer(
        &self,
        namespace: &str,
        ty: &str,
        id: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;

        let updated = {
            let stored = inner.get_mut(namespace, ty, id)?;

            if !stored.metadata_mut().finalizers_mut().add(finalizer) {
                return Ok(());
            }

            let next = stored.metadata().version().next();
            stored.metadata_mut().set_version(next);
            stored.clone()
        };

        inner.dispatch(EventKind::Updated, &updated);

        Ok(())
    }

    /// Releases a finalizer. A no-op (and no event) if not present.
    pub async fn remove_finalizer(
        &self,
        namespace: &str,
        ty: &str,
        id: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;

        let updated = {
            let stored = inner.get_mut(namespace, ty, id)?;

            if !stored.metadata_mut().finalizers_mut().remove(finalizer) {
                return Ok(());
            }

            let next = stored.metadata().version().next();
            stored.metadata_mut().set_version(next);
            stored.clone()
        };

        inner.dispatch(EventKind::Updated, &updated);

        Ok(())
    }

    /// Opens a watch on the resources matching `query`.
    ///
    /// The current matching set is replayed as [`EventKind::Bootstrap`]
    /// events (in id order) before any live event is delivered. Dropping the
    /// receiver cancels the watch; a new call returns a fresh stream.
    pub async fn watch(&self, query: Query) -> Result<mpsc::UnboundedReceiver<Event>, Error> {
        let mut inner = self.inner.lock().await;

        inner.check_registered(query.namespace(), query.ty())?;

        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(resources) = inner.collection(query.namespace(), query.ty()) {
            for resource in resources.values() {
                if !query.matches(resource.metadata()) {
                    continue;
                }

                // The receiver is still in scope, so the send can't fail.
                let _ = tx.send(Event {
                    kind: EventKind::Bootstrap,
                    resource: resource.clone(),
                });
            }
        }

        inner.watchers.push(Watcher { query, tx });

        Ok(rx)
    }
}

/// Registers a raw resource, bypassing spec typing. Test-only helper for
/// exercising the escape hatch.
#[cfg(test)]
pub(crate) fn raw_resource(namespace: &str, ty: &str, id: &str, yaml: &str) -> Resource {
    Resource::new(
        crate::Metadata::new(namespace, ty, id),
        crate::Spec::Raw(yaml.to_string()),
    )
}
