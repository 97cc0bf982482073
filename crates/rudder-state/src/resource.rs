use std::fmt;

use crate::spec::Spec;

/// Monotonic resource version.
///
/// Bumped by the store on every successful mutation. Clients must treat the
/// value as opaque; the only meaningful operations are equality (optimistic
/// concurrency) and the [`Version::UNDEFINED`] sentinel, which matches any
/// version when used in a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u64);

impl Version {
    /// Sentinel that matches any version.
    pub const UNDEFINED: Version = Version(0);

    pub(crate) fn first() -> Version {
        Version(1)
    }

    pub(crate) fn next(self) -> Version {
        Version(self.0 + 1)
    }

    pub fn is_undefined(&self) -> bool {
        self.0 == 0
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            write!(f, "undefined")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Lifecycle phase of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Normal state, spec updates are accepted.
    Running,
    /// Destruction was requested; the resource is read-only except for
    /// finalizer removal until it can be destroyed.
    TearingDown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Running => "running",
            Phase::TearingDown => "tearing-down",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered set of finalizer strings attached to a resource.
///
/// A resource with finalizers cannot be destroyed; owners register a claim
/// with [`Finalizers::add`] and release it with [`Finalizers::remove`] once
/// their own teardown is complete. Both operations are idempotent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Finalizers(Vec<String>);

impl Finalizers {
    /// Adds a finalizer, returning `false` if it was already present.
    pub fn add(&mut self, finalizer: &str) -> bool {
        if self.0.iter().any(|f| f == finalizer) {
            return false;
        }

        self.0.push(finalizer.to_string());

        true
    }

    /// Removes a finalizer, returning `false` if it wasn't present.
    pub fn remove(&mut self, finalizer: &str) -> bool {
        let len = self.0.len();
        self.0.retain(|f| f != finalizer);

        self.0.len() != len
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Resource metadata: the (namespace, type, id) key plus version, phase and
/// finalizers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    namespace: String,
    ty: String,
    id: String,
    version: Version,
    phase: Phase,
    finalizers: Finalizers,
}

impl Metadata {
    pub fn new(
        namespace: impl Into<String>,
        ty: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Metadata {
            namespace: namespace.into(),
            ty: ty.into(),
            id: id.into(),
            version: Version::UNDEFINED,
            phase: Phase::Running,
            finalizers: Finalizers::default(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn finalizers(&self) -> &Finalizers {
        &self.finalizers
    }

    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub(crate) fn finalizers_mut(&mut self) -> &mut Finalizers {
        &mut self.finalizers
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.ty, self.id)
    }
}

/// A metadata query: either an exact (namespace, type, id) triple or a
/// (namespace, type) prefix matching every id of the kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    namespace: String,
    ty: String,
    id: Option<String>,
}

impl Query {
    /// Query for a single resource.
    pub fn exact(
        namespace: impl Into<String>,
        ty: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Query {
            namespace: namespace.into(),
            ty: ty.into(),
            id: Some(id.into()),
        }
    }

    /// Query for every resource of a kind.
    pub fn kind(namespace: impl Into<String>, ty: impl Into<String>) -> Self {
        Query {
            namespace: namespace.into(),
            ty: ty.into(),
            id: None,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        if self.namespace != metadata.namespace() || self.ty != metadata.ty() {
            return false;
        }

        match &self.id {
            Some(id) => id == metadata.id(),
            None => true,
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}/{}/{}", self.namespace, self.ty, id),
            None => write!(f, "{}/{}", self.namespace, self.ty),
        }
    }
}

/// A stored object: metadata plus a typed spec payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    metadata: Metadata,
    spec: Spec,
}

impl Resource {
    pub fn new(metadata: Metadata, spec: Spec) -> Self {
        Resource { metadata, spec }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub(crate) fn set_spec(&mut self, spec: Spec) {
        self.spec = spec;
    }
}
