//! Error types for casedesk.
//!
//! Each collaborator gets its own enum. `RegistryError` is what the
//! registries hand back to their callers and follows the office-facing
//! taxonomy: validation, fetch, persistence, upload, storage, not found.

use std::path::PathBuf;

use thiserror::Error;

/// Failures talking to the remote record store.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("constraint violated: {0}")]
    Constraint(String),
}

#[cfg(feature = "libsql")]
impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        let message = e.to_string();
        if message.contains("constraint failed") {
            DatabaseError::Constraint(message)
        } else {
            DatabaseError::Query(message)
        }
    }
}

/// Failures talking to the binary object store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object store I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object not found: {path}")]
    NotFound { path: String },

    #[error("invalid object path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

/// Configuration resolution failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {key}: {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to parse settings file: {0}")]
    ParseError(String),

    #[error("failed to read settings file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Caller-supplied data that violates a constraint. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("tax id for {kind} must have {expected} digits, got {actual}")]
    TaxIdLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("tax id may only contain digits and separators")]
    TaxIdFormat,

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("file is {size} bytes, the limit is {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("file type '{mime}' is not accepted")]
    UnsupportedFileType { mime: String },

    #[error("file is empty")]
    EmptyFile,
}

/// Operation-level error returned by the registries.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to fetch {what}: {source}")]
    Fetch {
        what: &'static str,
        #[source]
        source: DatabaseError,
    },

    #[error("failed to persist {what}: {source}")]
    Persistence {
        what: &'static str,
        #[source]
        source: DatabaseError,
    },

    #[error("upload failed: {0}")]
    Upload(#[source] StorageError),

    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

impl RegistryError {
    pub(crate) fn fetch(what: &'static str, source: DatabaseError) -> Self {
        Self::Fetch { what, source }
    }

    /// Persistence failures that mean "the row is not there" surface as
    /// `NotFound` so callers can tell a stale id from a backend outage.
    pub(crate) fn persistence(what: &'static str, source: DatabaseError) -> Self {
        match source {
            DatabaseError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Persistence {
                what,
                source: other,
            },
        }
    }

    /// True for errors the user can fix by changing the input.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
