use crate::database::Database;
use crate::error::StoreResult;
use crate::models::{VideoRecord, VideoStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::{debug, instrument};

/// Metadata store for video records in SQLite
#[derive(Debug, Clone)]
pub struct MetadataStore {
    db: Database,
}

const SELECT_VIDEO: &str = r#"
    SELECT id, filename, mime_type, duration_seconds, size_bytes,
           created_at, status, upload_attempts, last_upload_attempt_at, error
    FROM videos
"#;

impl MetadataStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace a record in a single statement
    #[instrument(skip(self, record), fields(video_id = %record.id))]
    pub async fn save(&self, record: &VideoRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO videos (
                id, filename, mime_type, duration_seconds, size_bytes,
                created_at, status, upload_attempts, last_upload_attempt_at, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                filename = excluded.filename,
                mime_type = excluded.mime_type,
                duration_seconds = excluded.duration_seconds,
                size_bytes = excluded.size_bytes,
                created_at = excluded.created_at,
                status = excluded.status,
                upload_attempts = excluded.upload_attempts,
                last_upload_attempt_at = excluded.last_upload_attempt_at,
                error = excluded.error
            "#,
        )
        .bind(&record.id)
        .bind(&record.filename)
        .bind(&record.mime_type)
        .bind(record.duration_seconds)
        .bind(record.size_bytes)
        .bind(record.created_at)
        .bind(record.status)
        .bind(record.upload_attempts)
        .bind(record.last_upload_attempt_at)
        .bind(&record.error)
        .execute(self.db.pool())
        .await?;

        debug!(status = %record.status, "Video record saved");
        Ok(())
    }

    /// Get a record by video id
    pub async fn get(&self, video_id: &str) -> StoreResult<Option<VideoRecord>> {
        let record = sqlx::query_as::<_, VideoRecord>(&format!("{SELECT_VIDEO} WHERE id = ?"))
            .bind(video_id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(record)
    }

    /// Every record, in no particular order
    pub async fn list(&self) -> StoreResult<Vec<VideoRecord>> {
        let records = sqlx::query_as::<_, VideoRecord>(SELECT_VIDEO)
            .fetch_all(self.db.pool())
            .await?;

        Ok(records)
    }

    /// Records currently in any of the given statuses
    pub async fn list_by_status(&self, statuses: &[VideoStatus]) -> StoreResult<Vec<VideoRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(SELECT_VIDEO);
        query.push(" WHERE status IN (");
        let mut separated = query.separated(", ");
        for status in statuses {
            separated.push_bind(*status);
        }
        separated.push_unseparated(")");

        let records = query
            .build_query_as::<VideoRecord>()
            .fetch_all(self.db.pool())
            .await?;

        Ok(records)
    }

    /// Move an existing record to `uploading` and count the attempt.
    ///
    /// Returns the updated record, or `None` if no record exists. Never
    /// inserts, so a deleted video stays deleted.
    pub async fn mark_upload_started(
        &self,
        video_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<VideoRecord>> {
        let record = sqlx::query_as::<_, VideoRecord>(
            r#"
            UPDATE videos SET
                status = ?,
                upload_attempts = upload_attempts + 1,
                last_upload_attempt_at = ?
            WHERE id = ?
            RETURNING id, filename, mime_type, duration_seconds, size_bytes,
                      created_at, status, upload_attempts, last_upload_attempt_at, error
            "#,
        )
        .bind(VideoStatus::Uploading)
        .bind(at)
        .bind(video_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(record)
    }

    /// Set the status of an existing record, leaving `error` untouched.
    /// Returns false if no record exists.
    pub async fn update_status(&self, video_id: &str, status: VideoStatus) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE videos SET status = ? WHERE id = ?")
            .bind(status)
            .bind(video_id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Set status and error of an existing record (`None` clears the error).
    /// Returns false if no record exists.
    pub async fn update_outcome(
        &self,
        video_id: &str,
        status: VideoStatus,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE videos SET status = ?, error = ? WHERE id = ?")
            .bind(status)
            .bind(error)
            .bind(video_id)
            .execute(self.db.pool())
            .await?;

        debug!(video_id = %video_id, status = %status, "Video status updated");
        Ok(result.rows_affected() > 0)
    }

    /// Completed records whose last upload happened before `before`
    pub async fn list_completed_before(&self, before: DateTime<Utc>) -> StoreResult<Vec<VideoRecord>> {
        let records = sqlx::query_as::<_, VideoRecord>(&format!("{SELECT_VIDEO} WHERE status = ?"))
            .bind(VideoStatus::Completed)
            .fetch_all(self.db.pool())
            .await?;

        // Timestamps are stored as text; compare them as instants
        Ok(records
            .into_iter()
            .filter(|r| r.last_upload_attempt_at.is_some_and(|at| at < before))
            .collect())
    }

    /// Delete a record; deleting a missing record is not an error
    pub async fn delete(&self, video_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM videos WHERE id = ?")
            .bind(video_id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Aggregate counts for dashboards
    pub async fn get_stats(&self) -> StoreResult<VideoStats> {
        let stats: VideoStats = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) AS total_videos,
                COALESCE(SUM(size_bytes), 0) AS total_bytes,
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'uploading' THEN 1 ELSE 0 END), 0) AS uploading,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed
            FROM videos
            "#,
        )
        .fetch_one(self.db.pool())
        .await?;

        Ok(stats)
    }
}

/// Record counts by status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, FromRow)]
pub struct VideoStats {
    pub total_videos: i64,
    pub total_bytes: i64,
    pub pending: i64,
    pub uploading: i64,
    pub completed: i64,
    pub failed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewVideo;

    fn record(id: &str) -> VideoRecord {
        VideoRecord::pending(
            id,
            NewVideo {
                filename: format!("{id}.webm"),
                mime_type: "video/webm".to_string(),
                duration_seconds: 3.0,
            },
            100,
            Utc::now(),
        )
    }

    async fn store() -> MetadataStore {
        MetadataStore::new(Database::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_save_and_get_roundtrip() {
        let store = store().await;
        let mut original = record("v1");
        original.error = Some("network down".to_string());
        original.upload_attempts = 2;
        original.last_upload_attempt_at = Some(Utc::now());

        store.save(&original).await.unwrap();
        let loaded = store.get("v1").await.unwrap().unwrap();

        assert_eq!(loaded.id, original.id);
        assert_eq!(loaded.status, VideoStatus::Pending);
        assert_eq!(loaded.upload_attempts, 2);
        assert_eq!(loaded.error.as_deref(), Some("network down"));
        assert_eq!(loaded.created_at, original.created_at);
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let store = store().await;
        let mut r = record("v1");
        store.save(&r).await.unwrap();

        r.status = VideoStatus::Completed;
        store.save(&r).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, VideoStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let store = store().await;
        let mut failed = record("failed");
        failed.status = VideoStatus::Failed;
        let mut done = record("done");
        done.status = VideoStatus::Completed;

        store.save(&record("pending")).await.unwrap();
        store.save(&failed).await.unwrap();
        store.save(&done).await.unwrap();

        let mut ids: Vec<_> = store
            .list_by_status(&[VideoStatus::Failed, VideoStatus::Pending])
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["failed".to_string(), "pending".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = store().await;
        store.save(&record("v1")).await.unwrap();

        assert!(store.delete("v1").await.unwrap());
        assert!(!store.delete("v1").await.unwrap());
        assert!(store.get("v1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = store().await;
        let mut failed = record("b");
        failed.status = VideoStatus::Failed;
        store.save(&record("a")).await.unwrap();
        store.save(&failed).await.unwrap();

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_videos, 2);
        assert_eq!(stats.total_bytes, 200);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn test_list_completed_before() {
        let store = store().await;
        let now = Utc::now();

        let mut old = record("old");
        old.status = VideoStatus::Completed;
        old.last_upload_attempt_at = Some(now - chrono::Duration::days(10));
        let mut recent = record("recent");
        recent.status = VideoStatus::Completed;
        recent.last_upload_attempt_at = Some(now);
        let mut failed = record("failed");
        failed.status = VideoStatus::Failed;
        failed.last_upload_attempt_at = Some(now - chrono::Duration::days(10));

        for r in [&old, &recent, &failed] {
            store.save(r).await.unwrap();
        }

        let expired = store
            .list_completed_before(now - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "old");
    }

    #[tokio::test]
    async fn test_status_updates_never_insert() {
        let store = store().await;

        assert!(store
            .mark_upload_started("gone", Utc::now())
            .await
            .unwrap()
            .is_none());
        assert!(!store
            .update_outcome("gone", VideoStatus::Failed, Some("lost"))
            .await
            .unwrap());
        assert!(!store.update_status("gone", VideoStatus::Pending).await.unwrap());

        assert!(store.get("gone").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_updates_touch_only_their_fields() {
        let store = store().await;
        let original = record("v1");
        store.save(&original).await.unwrap();

        let at = Utc::now();
        let started = store.mark_upload_started("v1", at).await.unwrap().unwrap();
        assert_eq!(started.status, VideoStatus::Uploading);
        assert_eq!(started.upload_attempts, 1);
        assert_eq!(started.last_upload_attempt_at, Some(at));
        assert_eq!(started.filename, original.filename);

        assert!(store
            .update_outcome("v1", VideoStatus::Pending, Some("503"))
            .await
            .unwrap());
        assert!(store.update_status("v1", VideoStatus::Failed).await.unwrap());

        let loaded = store.get("v1").await.unwrap().unwrap();
        assert_eq!(loaded.status, VideoStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("503"));
        assert_eq!(loaded.upload_attempts, 1);

        store
            .update_outcome("v1", VideoStatus::Completed, None)
            .await
            .unwrap();
        assert!(store.get("v1").await.unwrap().unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_list_by_status_empty_filter() {
        let store = store().await;
        store.save(&record("v1")).await.unwrap();
        assert!(store.list_by_status(&[]).await.unwrap().is_empty());
    }
}
