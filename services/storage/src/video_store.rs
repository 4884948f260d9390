//! Durable local video store.
//!
//! Payload bytes go to whichever [`PayloadBackend`] initialization settles on;
//! metadata always lives in the SQLite `videos` table.

use crate::backend::{BackendKind, BlobTableBackend, FilesystemBackend, PayloadBackend};
use crate::config::{BackendPreference, StorageConfig};
use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use crate::metadata_store::{MetadataStore, VideoStats};
use crate::models::{NewVideo, StorageQuota, VideoRecord, VideoStatus};
use crate::scheduler::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

pub struct VideoStore {
    db: Database,
    metadata: MetadataStore,
    config: StorageConfig,
    clock: Arc<dyn Clock>,
    backend: OnceCell<Arc<dyn PayloadBackend>>,
}

impl VideoStore {
    /// Create a store over an open database. No I/O happens until
    /// [`initialize`](Self::initialize) or the first operation.
    pub fn new(db: Database, config: StorageConfig) -> Self {
        Self {
            metadata: MetadataStore::new(db.clone()),
            db,
            config,
            clock: Arc::new(SystemClock),
            backend: OnceCell::new(),
        }
    }

    /// Use `clock` to stamp `created_at` on finalized records
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Probe and open the payload backend and the metadata database.
    ///
    /// Safe to call repeatedly: the first successful call fixes the backend
    /// for the lifetime of the store and later calls return the same choice.
    pub async fn initialize(&self) -> StoreResult<BackendKind> {
        let backend = self.backend().await?;
        Ok(backend.kind())
    }

    async fn backend(&self) -> StoreResult<&Arc<dyn PayloadBackend>> {
        self.backend
            .get_or_try_init(|| self.select_backend())
            .await
    }

    async fn select_backend(&self) -> StoreResult<Arc<dyn PayloadBackend>> {
        self.db
            .health_check()
            .await
            .map_err(|e| StoreError::StorageUnavailable(format!("metadata database: {e}")))?;

        let backend: Arc<dyn PayloadBackend> = match self.config.backend {
            BackendPreference::Database => Arc::new(BlobTableBackend::new(self.db.clone())),
            BackendPreference::Filesystem => {
                Arc::new(FilesystemBackend::open(&self.config.data_dir).await?)
            }
            BackendPreference::Auto => match FilesystemBackend::open(&self.config.data_dir).await {
                Ok(fs) => Arc::new(fs),
                Err(e) => {
                    warn!(
                        error = %e,
                        data_dir = %self.config.data_dir.display(),
                        "Payload directory unusable, falling back to database blobs"
                    );
                    Arc::new(BlobTableBackend::new(self.db.clone()))
                }
            },
        };

        info!(backend = %backend.kind(), "Video store initialized");
        Ok(backend)
    }

    /// The backend chosen at initialization, if initialization has happened
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.get().map(|b| b.kind())
    }

    /// Write one capture chunk.
    ///
    /// A first chunk discards any earlier content for the id and starts a
    /// fresh payload; later chunks are appended in call order.
    #[instrument(skip(self, chunk), fields(size_bytes = chunk.len()))]
    pub async fn append_chunk(
        &self,
        video_id: &str,
        chunk: &[u8],
        is_first_chunk: bool,
    ) -> StoreResult<()> {
        let backend = self.backend().await?;

        if is_first_chunk {
            backend.put(video_id, chunk).await?;
        } else {
            backend.append(video_id, chunk).await?;
        }

        metrics::counter!("reelsafe.chunks.appended").increment(1);
        metrics::counter!("reelsafe.bytes.written").increment(chunk.len() as u64);

        Ok(())
    }

    /// Write the complete payload in one shot and persist the initial
    /// `pending` record. Overwrites anything chunked writes produced.
    #[instrument(skip(self, blob, video), fields(size_bytes = blob.len()))]
    pub async fn finalize_video(
        &self,
        video_id: &str,
        blob: &[u8],
        video: NewVideo,
    ) -> StoreResult<VideoRecord> {
        let backend = self.backend().await?;
        backend.put(video_id, blob).await?;

        let record = VideoRecord::pending(video_id, video, blob.len() as i64, self.clock.now());
        self.metadata
            .save(&record)
            .await
            .map_err(|e| StoreError::write_rejected(video_id, e))?;

        info!(
            video_id = %video_id,
            size_bytes = blob.len(),
            "Video finalized"
        );

        Ok(record)
    }

    /// The full payload, or `None` if nothing was ever written for the id
    pub async fn get_video(&self, video_id: &str) -> StoreResult<Option<Vec<u8>>> {
        self.backend().await?.get(video_id).await
    }

    /// Remove payload, then metadata. Either half may already be gone.
    #[instrument(skip(self))]
    pub async fn delete_video(&self, video_id: &str) -> StoreResult<()> {
        self.backend().await?.delete(video_id).await?;
        let existed = self.metadata.delete(video_id).await?;

        debug!(video_id = %video_id, existed, "Video deleted");
        Ok(())
    }

    /// Remove only the payload, keeping the record (retention purges)
    pub async fn purge_payload(&self, video_id: &str) -> StoreResult<()> {
        self.backend().await?.delete(video_id).await
    }

    pub async fn save_metadata(&self, record: &VideoRecord) -> StoreResult<()> {
        self.backend().await?;
        self.metadata.save(record).await
    }

    pub async fn get_metadata(&self, video_id: &str) -> StoreResult<Option<VideoRecord>> {
        self.backend().await?;
        self.metadata.get(video_id).await
    }

    /// Unordered snapshot of every record
    pub async fn get_all_metadata(&self) -> StoreResult<Vec<VideoRecord>> {
        self.backend().await?;
        self.metadata.list().await
    }

    pub async fn get_metadata_by_status(
        &self,
        statuses: &[VideoStatus],
    ) -> StoreResult<Vec<VideoRecord>> {
        self.backend().await?;
        self.metadata.list_by_status(statuses).await
    }

    pub async fn get_completed_before(
        &self,
        before: DateTime<Utc>,
    ) -> StoreResult<Vec<VideoRecord>> {
        self.backend().await?;
        self.metadata.list_completed_before(before).await
    }

    /// See [`MetadataStore::mark_upload_started`]
    pub async fn mark_upload_started(
        &self,
        video_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<VideoRecord>> {
        self.backend().await?;
        self.metadata.mark_upload_started(video_id, at).await
    }

    /// Change only the status of an existing record; false if it is gone
    pub async fn update_status(&self, video_id: &str, status: VideoStatus) -> StoreResult<bool> {
        self.backend().await?;
        self.metadata.update_status(video_id, status).await
    }

    /// Change status and error of an existing record; false if it is gone
    pub async fn update_outcome(
        &self,
        video_id: &str,
        status: VideoStatus,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        self.backend().await?;
        self.metadata.update_outcome(video_id, status, error).await
    }

    pub async fn delete_metadata(&self, video_id: &str) -> StoreResult<()> {
        self.backend().await?;
        self.metadata.delete(video_id).await?;
        Ok(())
    }

    pub async fn get_stats(&self) -> StoreResult<VideoStats> {
        self.backend().await?;
        self.metadata.get_stats().await
    }

    /// Best-effort capacity report. Zero quota means "unknown", not "full".
    pub async fn get_storage_quota(&self) -> StorageQuota {
        let usage = match self.backend().await {
            Ok(backend) => backend.usage_bytes().await,
            Err(e) => Err(e),
        };

        match usage {
            Ok(usage_bytes) => StorageQuota::new(usage_bytes, self.config.quota_bytes),
            Err(e) => {
                warn!(error = %e, "Storage usage unavailable");
                StorageQuota::default()
            }
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}
