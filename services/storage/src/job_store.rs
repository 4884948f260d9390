use crate::database::Database;
use crate::error::StoreResult;
use crate::models::QueueJob;

/// Durable storage for upload jobs, one row per video
#[derive(Debug, Clone)]
pub struct JobStore {
    db: Database,
}

const SELECT_JOB: &str = r#"
    SELECT video_id, attempts, last_attempt_at, next_retry_at, error
    FROM upload_jobs
"#;

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace the job for its video
    pub async fn save(&self, job: &QueueJob) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_jobs (video_id, attempts, last_attempt_at, next_retry_at, error)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (video_id) DO UPDATE SET
                attempts = excluded.attempts,
                last_attempt_at = excluded.last_attempt_at,
                next_retry_at = excluded.next_retry_at,
                error = excluded.error
            "#,
        )
        .bind(&job.video_id)
        .bind(job.attempts)
        .bind(job.last_attempt_at)
        .bind(job.next_retry_at)
        .bind(&job.error)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    pub async fn get(&self, video_id: &str) -> StoreResult<Option<QueueJob>> {
        let job = sqlx::query_as::<_, QueueJob>(&format!("{SELECT_JOB} WHERE video_id = ?"))
            .bind(video_id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(job)
    }

    /// All outstanding jobs
    pub async fn list(&self) -> StoreResult<Vec<QueueJob>> {
        let jobs = sqlx::query_as::<_, QueueJob>(&format!("{SELECT_JOB} ORDER BY next_retry_at"))
            .fetch_all(self.db.pool())
            .await?;

        Ok(jobs)
    }

    /// Write a failed attempt's schedule, but only if the stored job still has
    /// `expected_attempts`. Returns false when the job was reset, re-added or
    /// removed since it was read, in which case the stored job wins.
    pub async fn record_failure(&self, job: &QueueJob, expected_attempts: u32) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE upload_jobs SET
                attempts = ?,
                last_attempt_at = ?,
                next_retry_at = ?,
                error = ?
            WHERE video_id = ? AND attempts = ?
            "#,
        )
        .bind(job.attempts)
        .bind(job.last_attempt_at)
        .bind(job.next_retry_at)
        .bind(&job.error)
        .bind(&job.video_id)
        .bind(expected_attempts)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove the job; removing a missing job is not an error
    pub async fn delete(&self, video_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM upload_jobs WHERE video_id = ?")
            .bind(video_id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
