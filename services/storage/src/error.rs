use thiserror::Error;

/// Errors surfaced by the video store and the upload queue.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No payload backend or metadata database could be opened
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Payload not found for video {0}")]
    PayloadNotFound(String),

    /// Capacity or I/O failure while writing a payload or record
    #[error("Write rejected for video {video_id}: {message}")]
    WriteRejected { video_id: String, message: String },

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Upload attempts exhausted after {0} attempts")]
    AttemptsExhausted(u32),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn write_rejected(video_id: &str, message: impl ToString) -> Self {
        Self::WriteRejected {
            video_id: video_id.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether the error means the payload or record simply does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PayloadNotFound(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
