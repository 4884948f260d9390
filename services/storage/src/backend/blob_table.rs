use super::{BackendKind, PayloadBackend};
use crate::database::Database;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

/// Payloads stored as BLOB rows in the `payloads` table.
///
/// SQLite has no in-place blob append through this API, so [`append`] reads
/// the existing blob and writes back the concatenation inside one transaction.
/// Each append therefore costs O(existing size): long recordings written in
/// many chunks get progressively slower on this backend.
///
/// [`append`]: PayloadBackend::append
pub struct BlobTableBackend {
    db: Database,
}

impl BlobTableBackend {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PayloadBackend for BlobTableBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::BlobTable
    }

    async fn put(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payloads (video_id, data, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (video_id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(data)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await
        .map_err(|e| StoreError::write_rejected(key, e))?;

        debug!(key = %key, size_bytes = data.len(), "Payload blob written");
        Ok(())
    }

    async fn append(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| StoreError::write_rejected(key, e))?;

        let existing: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT data FROM payloads WHERE video_id = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| StoreError::write_rejected(key, e))?;

        let mut blob = existing.map(|(bytes,)| bytes).unwrap_or_default();
        blob.extend_from_slice(data);

        sqlx::query(
            r#"
            INSERT INTO payloads (video_id, data, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (video_id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(&blob)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::write_rejected(key, e))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::write_rejected(key, e))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT data FROM payloads WHERE video_id = ?")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(row.map(|(bytes,)| bytes))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM payloads WHERE video_id = ?")
            .bind(key)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    async fn usage_bytes(&self) -> StoreResult<u64> {
        let (total,): (i64,) = sqlx::query_as("SELECT COALESCE(SUM(LENGTH(data)), 0) FROM payloads")
            .fetch_one(self.db.pool())
            .await?;

        Ok(total.max(0) as u64)
    }
}
