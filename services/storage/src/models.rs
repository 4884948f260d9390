//! Record types shared by the video store and the upload queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Upload lifecycle status of a video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum VideoStatus {
    /// Waiting for an upload attempt
    Pending,
    /// An upload attempt is in flight
    Uploading,
    /// Uploaded successfully
    Completed,
    /// Attempt ceiling reached or payload lost
    Failed,
}

impl VideoStatus {
    /// Statuses a manual retry is allowed to act on
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata describing one captured video and its upload lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct VideoRecord {
    /// Opaque id assigned at capture start
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub duration_seconds: f64,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub status: VideoStatus,
    /// Lifetime attempt counter, never reset
    pub upload_attempts: u32,
    pub last_upload_attempt_at: Option<DateTime<Utc>>,
    /// Last failure message, cleared on completion
    pub error: Option<String>,
}

/// Descriptive fields supplied by the capture layer at finalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVideo {
    pub filename: String,
    pub mime_type: String,
    #[serde(default)]
    pub duration_seconds: f64,
}

impl VideoRecord {
    /// Initial record for a freshly finalized payload
    pub fn pending(id: impl Into<String>, video: NewVideo, size_bytes: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            filename: video.filename,
            mime_type: video.mime_type,
            duration_seconds: video.duration_seconds,
            size_bytes,
            created_at: now,
            status: VideoStatus::Pending,
            upload_attempts: 0,
            last_upload_attempt_at: None,
            error: None,
        }
    }

    /// File extension derived from the mime type, used for object keys
    pub fn extension(&self) -> &'static str {
        let essence = self.mime_type.split(';').next().unwrap_or_default().trim();
        match essence.to_lowercase().as_str() {
            "video/webm" => "webm",
            "video/mp4" => "mp4",
            "video/quicktime" => "mov",
            "video/x-matroska" => "mkv",
            "video/ogg" => "ogv",
            _ => "bin",
        }
    }
}

/// A durable upload obligation and its retry schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct QueueJob {
    pub video_id: String,
    /// Retry counter, reset by a manual retry
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time the job may be attempted again
    pub next_retry_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl QueueJob {
    /// A job that is immediately eligible
    pub fn new(video_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            video_id: video_id.into(),
            attempts: 0,
            last_attempt_at: None,
            next_retry_at: now,
            error: None,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_retry_at
    }

    /// Clear the retry counter and make the job eligible right away
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.attempts = 0;
        self.next_retry_at = now;
    }
}

/// Capacity introspection result; all zeros means "unknown"
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageQuota {
    pub usage_bytes: u64,
    pub quota_bytes: u64,
    pub percent_used: f64,
}

impl StorageQuota {
    pub fn new(usage_bytes: u64, quota_bytes: u64) -> Self {
        let percent_used = if quota_bytes == 0 {
            0.0
        } else {
            usage_bytes as f64 / quota_bytes as f64 * 100.0
        };

        Self {
            usage_bytes,
            quota_bytes,
            percent_used,
        }
    }

    /// Zero quota means the capacity could not be determined
    pub fn is_known(&self) -> bool {
        self.quota_bytes > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_video() -> NewVideo {
        NewVideo {
            filename: "clip.webm".to_string(),
            mime_type: "video/webm;codecs=vp9".to_string(),
            duration_seconds: 12.5,
        }
    }

    #[test]
    fn test_pending_record_defaults() {
        let now = Utc::now();
        let record = VideoRecord::pending("v1", sample_video(), 2048, now);

        assert_eq!(record.status, VideoStatus::Pending);
        assert_eq!(record.upload_attempts, 0);
        assert_eq!(record.size_bytes, 2048);
        assert_eq!(record.created_at, now);
        assert!(record.error.is_none());
        assert!(record.last_upload_attempt_at.is_none());
    }

    #[test]
    fn test_extension_from_mime_type() {
        let mut record = VideoRecord::pending("v1", sample_video(), 0, Utc::now());
        assert_eq!(record.extension(), "webm");

        record.mime_type = "video/mp4".to_string();
        assert_eq!(record.extension(), "mp4");

        record.mime_type = "application/x-unknown".to_string();
        assert_eq!(record.extension(), "bin");
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&VideoStatus::Completed).unwrap(),
            "\"completed\""
        );
        assert!(VideoStatus::Failed.is_retryable());
        assert!(VideoStatus::Pending.is_retryable());
        assert!(!VideoStatus::Completed.is_retryable());
        assert!(!VideoStatus::Uploading.is_retryable());
    }

    #[test]
    fn test_job_eligibility_and_reset() {
        let now = Utc::now();
        let mut job = QueueJob::new("v1", now);
        assert!(job.is_eligible(now));

        job.attempts = 5;
        job.next_retry_at = now + chrono::Duration::seconds(30);
        assert!(!job.is_eligible(now));

        job.reset(now);
        assert_eq!(job.attempts, 0);
        assert!(job.is_eligible(now));
    }

    #[test]
    fn test_quota_percent() {
        let quota = StorageQuota::new(250, 1000);
        assert_eq!(quota.percent_used, 25.0);
        assert!(quota.is_known());

        let unknown = StorageQuota::new(250, 0);
        assert_eq!(unknown.percent_used, 0.0);
        assert!(!unknown.is_known());
    }
}
