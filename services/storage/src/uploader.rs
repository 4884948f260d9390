use crate::error::StoreResult;
use crate::models::VideoRecord;
use async_trait::async_trait;

/// The external operation that moves one payload to the remote endpoint.
///
/// Any `Err` counts as a failed attempt and is retried with backoff by the
/// upload queue. Implementations should not retry internally.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, payload: &[u8], record: &VideoRecord) -> StoreResult<()>;
}
