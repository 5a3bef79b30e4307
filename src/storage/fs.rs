use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use super::{ObjectStore, check_object_path};
use crate::error::StorageError;

/// Object store backed by a directory tree.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        check_object_path(path)?;
        Ok(self.root.join(path))
    }
}

fn io_error(path: &str, source: std::io::Error) -> StorageError {
    if source.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound {
            path: path.to_string(),
        }
    } else {
        StorageError::Io {
            path: path.to_string(),
            source,
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, path: &str, bytes: Bytes) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }
        // Write to a sibling temp file first so a reader never sees half a blob.
        let mut tmp = target.clone().into_os_string();
        tmp.push(".partial");
        let tmp = PathBuf::from(tmp);
        let written = match tokio::fs::write(&tmp, &bytes).await {
            Ok(()) => tokio::fs::rename(&tmp, &target).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path, error = %cleanup, "failed to remove partial upload");
            }
            return Err(io_error(path, e));
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes, StorageError> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target)
            .await
            .map(Bytes::from)
            .map_err(|e| io_error(path, e))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        tokio::fs::remove_file(&target)
            .await
            .map_err(|e| io_error(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());

        store
            .put("user/1.pdf", Bytes::from_static(b"%PDF-1.7"))
            .await
            .expect("put");
        assert_eq!(
            store.get("user/1.pdf").await.expect("get"),
            Bytes::from_static(b"%PDF-1.7")
        );

        store.delete("user/1.pdf").await.expect("delete");
        assert!(matches!(
            store.get("user/1.pdf").await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete("user/1.pdf").await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn put_leaves_no_partial_file_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        store
            .put("user/2.png", Bytes::from_static(b"png"))
            .await
            .expect("put");

        let names: Vec<String> = std::fs::read_dir(dir.path().join("user"))
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["2.png".to_string()]);
    }

    #[tokio::test]
    async fn failed_put_removes_the_partial_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        // A non-empty directory where the blob should go makes the rename fail.
        std::fs::create_dir_all(dir.path().join("user/3.pdf/inner")).expect("mkdir");

        let err = store
            .put("user/3.pdf", Bytes::from_static(b"%PDF-1.7"))
            .await
            .expect_err("rename onto a directory");
        assert!(matches!(err, StorageError::Io { .. }), "{err:?}");

        let names: Vec<String> = std::fs::read_dir(dir.path().join("user"))
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["3.pdf".to_string()]);
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path().join("root"));
        let err = store
            .put("../escape.pdf", Bytes::from_static(b"x"))
            .await
            .expect_err("must reject");
        assert!(matches!(err, StorageError::InvalidPath { .. }));
    }
}
