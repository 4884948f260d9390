use super::{BackendKind, PayloadBackend};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const PAYLOAD_EXTENSION: &str = "bin";
const PROBE_FILE: &str = ".probe";

/// Payloads stored as one file per video under a root directory
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Open the payload directory and verify it accepts writes.
    pub async fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(&root).await.map_err(|e| {
            StoreError::StorageUnavailable(format!("cannot create {}: {e}", root.display()))
        })?;

        // Probe with a real write so read-only mounts are detected up front
        let probe = root.join(PROBE_FILE);
        let probe_result = async {
            let mut file = fs::File::create(&probe).await?;
            file.write_all(b"probe").await?;
            file.sync_all().await?;
            fs::remove_file(&probe).await
        }
        .await;

        probe_result.map_err(|e| {
            StoreError::StorageUnavailable(format!("{} is not writable: {e}", root.display()))
        })?;

        info!(root = %root.display(), "Filesystem payload backend ready");

        Ok(Self { root })
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", encode_path_component(key), PAYLOAD_EXTENSION))
    }

    /// Persist directory entries (creates and renames) across power loss
    async fn sync_root(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        fs::File::open(&self.root).await?.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl PayloadBackend for FilesystemBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Filesystem
    }

    async fn put(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        let path = self.payload_path(key);
        let tmp = path.with_extension("tmp");

        // Write aside then rename, so readers never see a half-written payload
        let write = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &path).await?;
            self.sync_root().await
        }
        .await;

        if let Err(e) = write {
            let _ = fs::remove_file(&tmp).await;
            return Err(StoreError::write_rejected(key, e));
        }

        debug!(key = %key, size_bytes = data.len(), "Payload written");
        Ok(())
    }

    async fn append(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        let path = self.payload_path(key);

        let write = async {
            let created = !fs::try_exists(&path).await?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(data).await?;
            file.sync_data().await?;
            if created {
                self.sync_root().await?;
            }
            Ok::<_, std::io::Error>(())
        }
        .await;

        write.map_err(|e| StoreError::write_rejected(key, e))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        match fs::read(self.payload_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        match fs::remove_file(self.payload_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn usage_bytes(&self) -> StoreResult<u64> {
        let mut total = 0;
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PAYLOAD_EXTENSION) {
                continue;
            }
            total += entry.metadata().await?.len();
        }

        Ok(total)
    }
}

/// Escape a key into a file-name-safe component.
///
/// `[A-Za-z0-9-]` pass through; every other byte, including `_`, becomes
/// `_XX` (uppercase hex). The mapping is injective, so distinct keys never
/// share a file, and the output never contains a separator or `.`.
pub(crate) fn encode_path_component(component: &str) -> String {
    let mut encoded = String::with_capacity(component.len());
    for byte in component.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("_{byte:02X}")),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_path_component() {
        assert_eq!(
            encode_path_component("550e8400-e29b-41d4-a716-446655440000"),
            "550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(encode_path_component("../etc/passwd"), "_2E_2E_2Fetc_2Fpasswd");
        assert_eq!(encode_path_component("hello world"), "hello_20world");
        assert_eq!(encode_path_component("cam_1"), "cam_5F1");
        assert_eq!(encode_path_component("cam.1"), "cam_2E1");
    }

    #[tokio::test]
    async fn test_payload_stays_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::open(dir.path()).await.unwrap();

        backend.put("../escape", b"data").await.unwrap();
        assert!(dir.path().join("_2E_2E_2Fescape.bin").exists());
        assert!(!dir.path().parent().unwrap().join("escape.bin").exists());
        assert_eq!(backend.get("../escape").await.unwrap().unwrap(), b"data");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sync_root_opens_payload_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("payloads");
        let backend = FilesystemBackend::open(&root).await.unwrap();

        backend.put("v1", b"data").await.unwrap();
        backend.sync_root().await.unwrap();

        std::fs::remove_dir_all(&root).unwrap();
        assert!(backend.sync_root().await.is_err());
        assert!(backend.put("v1", b"data").await.is_err());
    }

    #[tokio::test]
    async fn test_similar_ids_keep_separate_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::open(dir.path()).await.unwrap();

        backend.put("cam.1", b"first-video").await.unwrap();
        backend.put("cam_1", b"second-video").await.unwrap();
        backend.append("cam 1", b"third").await.unwrap();
        backend.delete("cam_1").await.unwrap();

        assert_eq!(backend.get("cam.1").await.unwrap().unwrap(), b"first-video");
        assert_eq!(backend.get("cam 1").await.unwrap().unwrap(), b"third");
        assert!(backend.get("cam_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_probe_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        FilesystemBackend::open(dir.path()).await.unwrap();
        assert!(!dir.path().join(PROBE_FILE).exists());
    }

    #[tokio::test]
    async fn test_open_fails_when_root_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("payloads");
        std::fs::write(&file, b"occupied").unwrap();

        let result = FilesystemBackend::open(&file).await;
        assert!(matches!(result, Err(StoreError::StorageUnavailable(_))));
    }
}
