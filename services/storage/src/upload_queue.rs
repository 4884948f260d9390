//! Durable upload retry queue.
//!
//! Every `pending` video has a row in `upload_jobs`. Each processing tick
//! walks the table, attempts eligible jobs through the [`Uploader`], and
//! reconciles the outcome into the video's record:
//!
//! ```text
//!  (none)    --add_to_queue-->          pending
//!  pending   --attempt-->               uploading
//!  uploading --success-->               completed   (job removed)
//!  uploading --failure-->               pending     (job rescheduled)
//!  pending   --attempts >= ceiling-->   failed      (job removed)
//!  failed    --manual retry-->          pending     (attempts reset)
//! ```
//!
//! The job table fully describes outstanding work; the only in-memory state
//! is the flag that keeps two ticks from overlapping.

use crate::config::{QueueConfig, RetentionPolicy};
use crate::error::{StoreError, StoreResult};
use crate::job_store::JobStore;
use crate::models::{QueueJob, VideoStatus};
use crate::scheduler::{Clock, ScheduledTask, Scheduler, TickFn};
use crate::uploader::Uploader;
use crate::video_store::VideoStore;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Exponential backoff with a hard attempt ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
        }
    }

    /// Delay before the next attempt once `failed_attempts` attempts have
    /// failed: `base * 2^(failed_attempts - 1)`, so 1s, 2s, 4s, ... by default.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// What one processing tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    /// Another tick was already running, nothing was done
    pub skipped_busy: bool,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Jobs dropped because the attempt ceiling was reached
    pub exhausted: usize,
    /// Jobs dropped because their record or payload disappeared
    pub dropped: usize,
    /// Jobs still inside their backoff window
    pub waiting: usize,
}

enum AttemptOutcome {
    Succeeded,
    Failed,
    Dropped,
}

/// Clears the processing flag when a tick ends, even by panic
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct UploadQueue {
    store: Arc<VideoStore>,
    jobs: JobStore,
    uploader: Arc<dyn Uploader>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    policy: RetryPolicy,
    retention: RetentionPolicy,
    upload_timeout: Duration,
    tick_interval: Duration,
    processing: AtomicBool,
    task: Mutex<Option<ScheduledTask>>,
}

impl UploadQueue {
    pub fn new(
        store: Arc<VideoStore>,
        uploader: Arc<dyn Uploader>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn Scheduler>,
        config: &QueueConfig,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            jobs: JobStore::new(store.database().clone()),
            store,
            uploader,
            clock,
            scheduler,
            policy: RetryPolicy::from_config(config),
            retention,
            upload_timeout: config.upload_timeout(),
            tick_interval: config.tick_interval(),
            processing: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Enqueue (or re-enqueue) a video, immediately eligible
    #[instrument(skip(self))]
    pub async fn add_to_queue(&self, video_id: &str) -> StoreResult<QueueJob> {
        let job = QueueJob::new(video_id, self.clock.now());
        self.jobs.save(&job).await?;

        debug!(video_id = %video_id, "Video queued for upload");
        Ok(job)
    }

    /// Drop the job for a video; a missing job is not an error
    pub async fn remove_from_queue(&self, video_id: &str) -> StoreResult<()> {
        self.jobs.delete(video_id).await?;
        Ok(())
    }

    pub async fn get_job(&self, video_id: &str) -> StoreResult<Option<QueueJob>> {
        self.jobs.get(video_id).await
    }

    pub async fn list_jobs(&self) -> StoreResult<Vec<QueueJob>> {
        self.jobs.list().await
    }

    /// Delete a video everywhere: job first, then payload and metadata
    pub async fn delete_video(&self, video_id: &str) -> StoreResult<()> {
        self.remove_from_queue(video_id).await?;
        self.store.delete_video(video_id).await
    }

    /// Whether a tick is currently running
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Run one pass over the queue.
    ///
    /// Never fails: every error is folded into record/job state or logged, so
    /// one bad entry cannot stall the rest. An overlapping call returns at once
    /// with `skipped_busy` set.
    pub async fn process_queue(&self) -> ProcessSummary {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Queue tick already running, skipping");
            return ProcessSummary {
                skipped_busy: true,
                ..Default::default()
            };
        }
        let _guard = ProcessingGuard(&self.processing);

        let mut summary = ProcessSummary::default();

        let jobs = match self.jobs.list().await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to list upload jobs");
                return summary;
            }
        };

        for listed in jobs {
            // Resets and deletes made during earlier uploads win over the listing
            let job = match self.jobs.get(&listed.video_id).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!(video_id = %listed.video_id, error = %e, "Failed to read upload job");
                    continue;
                }
            };
            let now = self.clock.now();

            if !job.is_eligible(now) {
                summary.waiting += 1;
                continue;
            }

            if self.policy.is_exhausted(job.attempts) {
                self.exhaust(&job).await;
                summary.exhausted += 1;
                continue;
            }

            summary.attempted += 1;
            let video_id = job.video_id.clone();
            match self.attempt(job).await {
                Ok(AttemptOutcome::Succeeded) => summary.succeeded += 1,
                Ok(AttemptOutcome::Failed) => summary.failed += 1,
                Ok(AttemptOutcome::Dropped) => summary.dropped += 1,
                Err(e) => {
                    // Local storage trouble; the job stays put for the next tick
                    error!(video_id = %video_id, error = %e, "Upload attempt aborted");
                    summary.failed += 1;
                }
            }
        }

        self.apply_retention().await;

        if summary.attempted > 0 || summary.exhausted > 0 {
            info!(
                attempted = summary.attempted,
                succeeded = summary.succeeded,
                failed = summary.failed,
                exhausted = summary.exhausted,
                dropped = summary.dropped,
                waiting = summary.waiting,
                "Upload queue processed"
            );
        }

        summary
    }

    #[instrument(skip(self, job), fields(video_id = %job.video_id, attempts = job.attempts))]
    async fn attempt(&self, mut job: QueueJob) -> StoreResult<AttemptOutcome> {
        let Some(record) = self
            .store
            .mark_upload_started(&job.video_id, self.clock.now())
            .await?
        else {
            warn!("Video record vanished, dropping upload job");
            self.jobs.delete(&job.video_id).await?;
            return Ok(AttemptOutcome::Dropped);
        };

        let Some(payload) = self.store.get_video(&job.video_id).await? else {
            let message = StoreError::PayloadNotFound(job.video_id.clone()).to_string();
            warn!("Payload missing, marking video failed");
            self.store
                .update_outcome(&job.video_id, VideoStatus::Failed, Some(&message))
                .await?;
            self.jobs.delete(&job.video_id).await?;
            return Ok(AttemptOutcome::Dropped);
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.upload_timeout,
            self.uploader.upload(&payload, &record),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::UploadFailed(format!(
                "upload timed out after {}s",
                self.upload_timeout.as_secs()
            ))),
        };
        metrics::histogram!("reelsafe.upload.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                let recorded = self
                    .store
                    .update_outcome(&job.video_id, VideoStatus::Completed, None)
                    .await?;
                self.jobs.delete(&job.video_id).await?;

                if !recorded {
                    warn!("Video deleted while uploading, outcome discarded");
                    return Ok(AttemptOutcome::Dropped);
                }

                if self.retention == RetentionPolicy::DeleteOnSuccess {
                    if let Err(e) = self.store.purge_payload(&job.video_id).await {
                        warn!(error = %e, "Failed to purge uploaded payload");
                    }
                }

                metrics::counter!("reelsafe.uploads.succeeded").increment(1);
                info!(size_bytes = payload.len(), "Video uploaded");
                Ok(AttemptOutcome::Succeeded)
            }
            Err(e) => {
                let message = e.to_string();
                let failed_at = self.clock.now();
                let read_attempts = job.attempts;

                job.attempts += 1;
                job.last_attempt_at = Some(failed_at);
                job.next_retry_at = failed_at + to_chrono(self.policy.delay_for(job.attempts));
                job.error = Some(message.clone());

                let recorded = self
                    .store
                    .update_outcome(&job.video_id, VideoStatus::Pending, Some(&message))
                    .await?;

                if !recorded {
                    self.jobs.delete(&job.video_id).await?;
                } else if !self.jobs.record_failure(&job, read_attempts).await? {
                    debug!("Upload job changed during the attempt, keeping the newer schedule");
                }

                metrics::counter!("reelsafe.uploads.failed").increment(1);
                warn!(
                    error = %message,
                    attempts = job.attempts,
                    next_retry_at = %job.next_retry_at,
                    "Upload failed, rescheduled"
                );
                Ok(AttemptOutcome::Failed)
            }
        }
    }

    /// Mark a job's video permanently failed and drop the job
    async fn exhaust(&self, job: &QueueJob) {
        let exhausted = StoreError::AttemptsExhausted(job.attempts);
        let message = match &job.error {
            Some(last) => format!("{exhausted}: {last}"),
            None => exhausted.to_string(),
        };

        if let Err(e) = self
            .store
            .update_outcome(&job.video_id, VideoStatus::Failed, Some(&message))
            .await
        {
            error!(video_id = %job.video_id, error = %e, "Failed to mark video failed");
            return;
        }

        if let Err(e) = self.jobs.delete(&job.video_id).await {
            error!(video_id = %job.video_id, error = %e, "Failed to remove exhausted job");
            return;
        }

        metrics::counter!("reelsafe.uploads.exhausted").increment(1);
        warn!(
            video_id = %job.video_id,
            attempts = job.attempts,
            "Upload attempts exhausted, video marked failed"
        );
    }

    /// Manually retry one video: reset (or create) its job and run a pass
    /// right away. Completed or in-flight videos are left alone.
    #[instrument(skip(self))]
    pub async fn retry_video(&self, video_id: &str) -> StoreResult<ProcessSummary> {
        let record = self
            .store
            .get_metadata(video_id)
            .await?
            .ok_or_else(|| StoreError::PayloadNotFound(video_id.to_string()))?;

        if !record.status.is_retryable() {
            debug!(status = %record.status, "Retry ignored for non-retryable video");
            return Ok(ProcessSummary::default());
        }

        let now = self.clock.now();
        match self.jobs.get(video_id).await? {
            Some(mut job) => {
                job.reset(now);
                self.jobs.save(&job).await?;
            }
            None => {
                self.add_to_queue(video_id).await?;
            }
        }

        if record.status == VideoStatus::Failed {
            self.store
                .update_status(video_id, VideoStatus::Pending)
                .await?;
        }

        info!(video_id = %video_id, "Manual retry requested");
        Ok(self.process_queue().await)
    }

    /// Retry every failed or still-pending video. Returns how many were retried.
    pub async fn retry_all_failed(&self) -> StoreResult<usize> {
        let records = self
            .store
            .get_metadata_by_status(&[VideoStatus::Failed, VideoStatus::Pending])
            .await?;

        let mut retried = 0;
        for record in records {
            match self.retry_video(&record.id).await {
                Ok(_) => retried += 1,
                Err(e) => warn!(video_id = %record.id, error = %e, "Retry failed"),
            }
        }

        Ok(retried)
    }

    /// Bring the job table in line with the records after a restart:
    /// unresolved records without a job get one, jobs without a record go.
    pub async fn reconcile(&self) -> StoreResult<usize> {
        let mut repaired = 0;

        let unresolved = self
            .store
            .get_metadata_by_status(&[VideoStatus::Pending, VideoStatus::Uploading])
            .await?;
        for record in unresolved {
            if self.jobs.get(&record.id).await?.is_none() {
                self.add_to_queue(&record.id).await?;
                repaired += 1;
            }
        }

        for job in self.jobs.list().await? {
            if self.store.get_metadata(&job.video_id).await?.is_none() {
                self.jobs.delete(&job.video_id).await?;
                repaired += 1;
            }
        }

        if repaired > 0 {
            info!(repaired, "Upload queue reconciled with video records");
        }
        Ok(repaired)
    }

    /// Start the periodic tick and run one pass immediately
    pub async fn start_processing(self: &Arc<Self>) -> ProcessSummary {
        {
            let mut task = self.task.lock();
            if task.is_none() {
                let queue = Arc::downgrade(self);
                let tick: TickFn = Arc::new(move || {
                    let queue = queue.clone();
                    async move {
                        if let Some(queue) = queue.upgrade() {
                            queue.process_queue().await;
                        }
                    }
                    .boxed()
                });

                *task = Some(self.scheduler.schedule_repeating(self.tick_interval, tick));
                info!(
                    interval_secs = self.tick_interval.as_secs(),
                    "Upload queue processing started"
                );
            }
        }

        if let Err(e) = self.reconcile().await {
            warn!(error = %e, "Queue reconciliation failed");
        }

        self.process_queue().await
    }

    /// Stop the periodic tick. An in-flight pass runs to completion.
    pub async fn stop_processing(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.shutdown().await;
            info!("Upload queue processing stopped");
        }
    }

    /// Purge payloads of uploads older than the retention window
    async fn apply_retention(&self) {
        let RetentionPolicy::DeleteAfterDays(days) = self.retention else {
            return;
        };

        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(days));
        let expired = match self.store.get_completed_before(cutoff).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to list expired uploads");
                return;
            }
        };

        for record in expired {
            if let Err(e) = self.store.purge_payload(&record.id).await {
                warn!(video_id = %record.id, error = %e, "Failed to purge uploaded payload");
            }
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
