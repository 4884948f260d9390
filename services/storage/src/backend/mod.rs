//! Payload storage backends.
//!
//! The video store holds exactly one [`PayloadBackend`], chosen at
//! initialization:
//!
//! - [`FilesystemBackend`]: one file per video under a local directory,
//!   appends are positioned writes at the end of the file.
//! - [`BlobTableBackend`]: one row per video in the SQLite `payloads` table,
//!   used when the payload directory cannot be written.

mod blob_table;
mod filesystem;

pub use blob_table::BlobTableBackend;
pub use filesystem::FilesystemBackend;
pub(crate) use filesystem::encode_path_component;

use crate::error::StoreResult;
use async_trait::async_trait;

/// Which payload backend is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Filesystem,
    BlobTable,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filesystem => f.write_str("filesystem"),
            Self::BlobTable => f.write_str("blob_table"),
        }
    }
}

/// Named byte blobs with whole-value writes and appends
#[async_trait]
pub trait PayloadBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Replace the blob under `key` with `data`
    async fn put(&self, key: &str, data: &[u8]) -> StoreResult<()>;

    /// Append `data` to the blob under `key`, creating it if absent
    async fn append(&self, key: &str, data: &[u8]) -> StoreResult<()>;

    /// Full contents of the blob, or `None` if it does not exist
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Remove the blob; removing a missing blob is not an error
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Total bytes held by this backend
    async fn usage_bytes(&self) -> StoreResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    async fn exercise_backend(backend: &dyn PayloadBackend) {
        backend.put("v1", b"AAA").await.unwrap();
        backend.append("v1", b"BBB").await.unwrap();
        backend.append("v1", b"CC").await.unwrap();
        assert_eq!(backend.get("v1").await.unwrap().unwrap(), b"AAABBBCC");

        // A put discards whatever was there before
        backend.put("v1", b"Z").await.unwrap();
        assert_eq!(backend.get("v1").await.unwrap().unwrap(), b"Z");

        // Appending to a missing blob creates it
        backend.append("v2", b"new").await.unwrap();
        assert_eq!(backend.get("v2").await.unwrap().unwrap(), b"new");

        assert_eq!(backend.usage_bytes().await.unwrap(), 4);

        backend.delete("v1").await.unwrap();
        backend.delete("v1").await.unwrap();
        assert!(backend.get("v1").await.unwrap().is_none());
        assert!(backend.get("never-written").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_filesystem_backend_contract() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::open(dir.path()).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Filesystem);
        exercise_backend(&backend).await;
    }

    #[tokio::test]
    async fn test_blob_table_backend_contract() {
        let db = Database::in_memory().await.unwrap();
        let backend = BlobTableBackend::new(db);
        assert_eq!(backend.kind(), BackendKind::BlobTable);
        exercise_backend(&backend).await;
    }
}
