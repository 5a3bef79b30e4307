//! Binary object store for uploaded document files.
//!
//! Paths are opaque strings built by [`object_path_for_upload`]; the store
//! only has to put, get, and delete bytes under them.

mod fs;
mod memory;

use std::path::{Component, Path};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::StorageError;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Bytes) -> Result<(), StorageError>;
    async fn get(&self, path: &str) -> Result<Bytes, StorageError>;
    async fn delete(&self, path: &str) -> Result<(), StorageError>;
}

pub fn object_store_from_config(config: &StorageConfig) -> Arc<dyn ObjectStore> {
    match config.backend {
        StorageBackend::Filesystem => Arc::new(FsObjectStore::new(config.root.clone())),
        StorageBackend::Memory => Arc::new(MemoryObjectStore::new()),
    }
}

/// Object path for a new upload: `<actor id>/<unix millis>-<nonce>.<ext>`.
///
/// The actor prefix keeps different users apart; the millisecond stamp plus
/// a random nonce keeps concurrent uploads by one user apart.
pub fn object_path_for_upload(actor_id: Uuid, now: DateTime<Utc>, file_name: &str) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    let stamp = format!("{}-{}", now.timestamp_millis(), &nonce[..8]);
    match file_extension(file_name) {
        Some(ext) => format!("{actor_id}/{stamp}.{ext}"),
        None => format!("{actor_id}/{stamp}"),
    }
}

fn file_extension(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Reject paths that could escape the store root.
pub(crate) fn check_object_path(path: &str) -> Result<(), StorageError> {
    let invalid = |reason: &str| StorageError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    if path.trim().is_empty() {
        return Err(invalid("path is empty"));
    }
    if Path::new(path)
        .components()
        .any(|c| matches!(c, Component::RootDir | Component::Prefix(_)))
    {
        return Err(invalid("path must be relative"));
    }
    // `components()` folds away `.` and empty segments, so check the raw text.
    for segment in path.split(['/', '\\']) {
        match segment {
            "" => return Err(invalid("empty path segment")),
            "." => return Err(invalid("'.' is not allowed")),
            ".." => return Err(invalid("'..' is not allowed")),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_paths_are_scoped_to_actor_and_unique() {
        let actor = Uuid::new_v4();
        let now = Utc::now();
        let a = object_path_for_upload(actor, now, "Contract.PDF");
        let b = object_path_for_upload(actor, now, "Contract.PDF");

        assert!(a.starts_with(&format!("{actor}/{}-", now.timestamp_millis())));
        assert!(a.ends_with(".pdf"));
        assert_ne!(a, b);
        check_object_path(&a).expect("generated path is valid");
    }

    #[test]
    fn upload_path_without_extension_has_no_dot() {
        let path = object_path_for_upload(Uuid::new_v4(), Utc::now(), "README");
        assert!(!path.contains('.'));
    }

    #[test]
    fn object_paths_cannot_escape_root() {
        assert!(check_object_path("../secrets").is_err());
        assert!(check_object_path("/etc/passwd").is_err());
        assert!(check_object_path("a/./b").is_err());
        assert!(check_object_path("./a").is_err());
        assert!(check_object_path("a//b").is_err());
        assert!(check_object_path("a\\..\\b").is_err());
        assert!(check_object_path("").is_err());
        assert!(check_object_path("user/123.pdf").is_ok());
    }
}
