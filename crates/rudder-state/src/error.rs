use thiserror::Error;

/// Typed store errors.
///
/// All of these are recoverable by the caller; controllers typically swallow
/// [`Error::NotFound`] for inputs that don't exist yet and retry
/// [`Error::Conflict`] after re-reading.
#[derive(Debug, Error)]
pub enum Error {
    #[error("resource {namespace}/{ty}/{id} doesn't exist")]
    NotFound {
        namespace: String,
        ty: String,
        id: String,
    },

    #[error("resource {namespace}/{ty}/{id} already exists")]
    AlreadyExists {
        namespace: String,
        ty: String,
        id: String,
    },

    #[error("update conflict for {namespace}/{ty}/{id}: {reason}")]
    Conflict {
        namespace: String,
        ty: String,
        id: String,
        reason: String,
    },

    #[error("namespace {0} is not registered")]
    UnknownNamespace(String),

    #[error("resource type {0} is not registered")]
    UnknownType(String),

    #[error("resource {namespace}/{ty}/{id} still has finalizers")]
    HasFinalizers {
        namespace: String,
        ty: String,
        id: String,
    },

    #[error("controller {controller} is not permitted to manage {namespace}/{ty}")]
    PermissionDenied {
        controller: String,
        namespace: String,
        ty: String,
    },
}

impl Error {
    pub(crate) fn not_found(namespace: &str, ty: &str, id: &str) -> Self {
        Error::NotFound {
            namespace: namespace.to_string(),
            ty: ty.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn already_exists(namespace: &str, ty: &str, id: &str) -> Self {
        Error::AlreadyExists {
            namespace: namespace.to_string(),
            ty: ty.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn conflict(namespace: &str, ty: &str, id: &str, reason: impl Into<String>) -> Self {
        Error::Conflict {
            namespace: namespace.to_string(),
            ty: ty.to_string(),
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn has_finalizers(namespace: &str, ty: &str, id: &str) -> Self {
        Error::HasFinalizers {
            namespace: namespace.to_string(),
            ty: ty.to_string(),
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn is_has_finalizers(&self) -> bool {
        matches!(self, Error::HasFinalizers { .. })
    }
}
