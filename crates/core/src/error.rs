//! Error taxonomy shared by clients, backends and processors.
//!
//! Display strings are part of the caller contract: callers pattern-match on
//! them, so the wording here is fixed.

use crate::{Kind, ResourceKey};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed request or missing precondition field.
    #[error("error with field {field} = '{value}' ({reason})")]
    InvalidInput { field: String, value: String, reason: String },
    #[error("resource does not exist: {key} with error: {cause}")]
    NotFound { key: ResourceKey, cause: String },
    #[error("resource already exists: {key}")]
    AlreadyExists { key: ResourceKey },
    /// Revision precondition mismatch.
    #[error("update conflict: {key}")]
    Conflict { key: ResourceKey },
    #[error("operation cancelled: {reason}")]
    Cancelled { reason: String },
    #[error("unable to convert {key}: {reason}")]
    ConversionFailure { key: ResourceKey, reason: String },
    /// Transport or connection loss on a watch.
    #[error("watch stream error: {0}")]
    StreamError(String),
    /// A key of the wrong kind reached a per-kind component.
    #[error("incorrect key type - expecting resource of kind {expected}, got {actual}")]
    KindMismatch { expected: Kind, actual: Kind },
    /// Uncategorized datastore failure on a CRUD call.
    #[error("datastore error: {0}")]
    Datastore(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn invalid_input(field: impl Into<String>, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput { field: field.into(), value: value.into(), reason: reason.into() }
    }

    pub fn not_found(key: ResourceKey, cause: impl Into<String>) -> Self {
        Self::NotFound { key, cause: cause.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Field name for input-validation failures.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::InvalidInput { field, .. } => Some(field),
            _ => None,
        }
    }

    /// Resource key the error refers to, when it refers to one.
    pub fn key(&self) -> Option<&ResourceKey> {
        match self {
            Self::NotFound { key, .. }
            | Self::AlreadyExists { key }
            | Self::Conflict { key }
            | Self::ConversionFailure { key, .. } => Some(key),
            _ => None,
        }
    }
}
