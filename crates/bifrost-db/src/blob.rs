//! Filesystem blob store.
//!
//! Lays execution artifacts out under `{root}/execution-data/{id}/...`,
//! matching the object-storage container layout. Paths are validated so a
//! crafted execution id cannot escape the root.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

use bifrost_core::storage::{BlobStore, StorageError};

/// Container directory under the root.
const EXECUTION_CONTAINER: &str = "execution-data";

/// Blob store rooted at a local directory.
#[derive(Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(StorageError::Backend(format!(
                        "Invalid blob path: {path}"
                    )))
                }
            }
        }
        Ok(self.root.join(EXECUTION_CONTAINER).join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        path: &str,
        content: &[u8],
        _content_type: &str,
    ) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Backend(e.to_string())),
        }
    }

    async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Backend(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        store
            .put("abc-123/result.json", b"{\"sum\":42}", "application/json")
            .await
            .unwrap();
        let content = store.get("abc-123/result.json").await.unwrap().unwrap();
        assert_eq!(content, b"{\"sum\":42}");

        assert!(store.delete("abc-123/result.json").await.unwrap());
        assert!(store.get("abc-123/result.json").await.unwrap().is_none());
        assert!(!store.delete("abc-123/result.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_blobs_land_under_container_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        store
            .put("abc/logs.json", b"[]", "application/json")
            .await
            .unwrap();
        assert!(dir
            .path()
            .join("execution-data")
            .join("abc")
            .join("logs.json")
            .exists());
    }

    #[tokio::test]
    async fn test_traversal_paths_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.get("../escape.json").await.is_err());
        assert!(store.put("/abs/path.json", b"", "text/plain").await.is_err());
    }
}
