//! Reelsafe Storage Service
//!
//! Crash-safe local storage for recorded videos, paired with a durable upload
//! retry queue. Captures are persisted chunk by chunk as they are recorded,
//! finalized into a `pending` record, and then moved to S3 by a periodic queue
//! that retries failed uploads with exponential backoff until an attempt
//! ceiling is reached.
//!
//! ## Features
//!
//! - **Two Payload Backends**: Files on disk when the data directory is usable,
//!   blobs in SQLite otherwise. The choice is made once at initialization.
//! - **Durable Retry Queue**: Jobs live in SQLite next to the video records, so
//!   outstanding uploads survive restarts.
//! - **Bounded Retries**: 1s, 2s, 4s, 8s, 16s backoff by default, after which the
//!   video is marked `failed` until manually retried.
//! - **Control API**: HTTP endpoints for chunk ingest, inspection, retries and
//!   quota reporting.
//!
//! ## Architecture
//!
//! ```text
//!  Capture chunks          Video Store                  SQLite
//! ┌──────────────┐        ┌──────────────┐          ┌──────────────┐
//! │ Control API  │───────▶│ Payload      │─────────▶│ payloads     │
//! │              │        │ Backend      │   (or    │ videos       │
//! └──────────────┘        └──────────────┘   disk)  │ upload_jobs  │
//!        │                       ▲                  └──────────────┘
//!        ▼                       │                         ▲
//! ┌──────────────┐               │                         │
//! │ Upload       │───────────────┴─────────────────────────┘
//! │ Queue        │
//! └──────────────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │ S3 Uploader  │
//! └──────────────┘
//! ```

pub mod api;
pub mod backend;
pub mod config;
pub mod database;
pub mod error;
pub mod job_store;
pub mod metadata_store;
pub mod models;
pub mod s3_uploader;
pub mod scheduler;
pub mod upload_queue;
pub mod uploader;
pub mod video_store;

pub use api::AppState;
pub use backend::{BackendKind, PayloadBackend};
pub use config::{Config, RetentionPolicy};
pub use database::Database;
pub use error::{StoreError, StoreResult};
pub use metadata_store::VideoStats;
pub use models::{NewVideo, QueueJob, StorageQuota, VideoRecord, VideoStatus};
pub use s3_uploader::S3Uploader;
pub use scheduler::{Clock, ManualClock, ManualScheduler, Scheduler, SystemClock, TokioScheduler};
pub use upload_queue::{ProcessSummary, RetryPolicy, UploadQueue};
pub use uploader::Uploader;
pub use video_store::VideoStore;
