use crate::config::ApiConfig;
use crate::error::StoreError;
use crate::metadata_store::VideoStats;
use crate::models::{NewVideo, QueueJob, StorageQuota, VideoRecord};
use crate::upload_queue::{ProcessSummary, UploadQueue};
use crate::video_store::VideoStore;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<VideoStore>,
    pub queue: Arc<UploadQueue>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Query parameters for chunk appends
#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    /// Start a fresh payload, discarding earlier content
    #[serde(default)]
    pub first: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetryAllResponse {
    pub retried: usize,
}

pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            StoreError::PayloadNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            StoreError::StorageUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_UNAVAILABLE")
            }
            StoreError::WriteRejected { .. } => (StatusCode::INSUFFICIENT_STORAGE, "WRITE_REJECTED"),
            StoreError::UploadFailed(_) | StoreError::AttemptsExhausted(_) => {
                (StatusCode::BAD_GATEWAY, "UPLOAD_FAILED")
            }
            StoreError::Database(_) | StoreError::Io(_) => {
                error!(error = %self.0, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/videos", get(list_videos))
        .route("/videos/stats", get(video_stats))
        .route("/videos/retry-failed", post(retry_all_failed))
        .route("/videos/:video_id", get(get_video).delete(delete_video))
        .route("/videos/:video_id/payload", get(get_payload))
        .route("/videos/:video_id/chunks", put(append_chunk))
        .route("/videos/:video_id/finalize", post(finalize_video))
        .route("/videos/:video_id/retry", post(retry_video))
        .route("/storage/quota", get(storage_quota))
        .route("/queue", get(list_queue))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let backend = state.store.backend_kind().map(|kind| kind.to_string());

    match state.store.database().health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "backend": backend,
                "processing": state.queue.is_processing(),
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unhealthy",
                "backend": backend,
                "error": e.to_string(),
            })),
        ),
    }
}

async fn list_videos(State(state): State<AppState>) -> ApiResult<Json<Vec<VideoRecord>>> {
    Ok(Json(state.store.get_all_metadata().await?))
}

async fn get_video(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
) -> ApiResult<Json<VideoRecord>> {
    state
        .store
        .get_metadata(&video_id)
        .await?
        .map(Json)
        .ok_or_else(|| StoreError::PayloadNotFound(video_id).into())
}

async fn get_payload(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
) -> ApiResult<Response> {
    let payload = state
        .store
        .get_video(&video_id)
        .await?
        .ok_or_else(|| StoreError::PayloadNotFound(video_id.clone()))?;

    let content_type = state
        .store
        .get_metadata(&video_id)
        .await?
        .map(|r| r.mime_type)
        .unwrap_or_else(|| "application/octet-stream".to_string());

    Ok(([(header::CONTENT_TYPE, content_type)], payload).into_response())
}

#[instrument(skip(state))]
async fn delete_video(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.queue.delete_video(&video_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, body), fields(size_bytes = body.len()))]
async fn append_chunk(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    state
        .store
        .append_chunk(&video_id, &body, query.first)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, video))]
async fn finalize_video(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
    Json(video): Json<NewVideo>,
) -> ApiResult<(StatusCode, Json<VideoRecord>)> {
    let payload = state
        .store
        .get_video(&video_id)
        .await?
        .ok_or_else(|| StoreError::PayloadNotFound(video_id.clone()))?;

    let record = state
        .store
        .finalize_video(&video_id, &payload, video)
        .await?;
    state.queue.add_to_queue(&video_id).await?;

    Ok((StatusCode::CREATED, Json(record)))
}

async fn retry_video(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
) -> ApiResult<Json<ProcessSummary>> {
    Ok(Json(state.queue.retry_video(&video_id).await?))
}

async fn retry_all_failed(State(state): State<AppState>) -> ApiResult<Json<RetryAllResponse>> {
    let retried = state.queue.retry_all_failed().await?;
    Ok(Json(RetryAllResponse { retried }))
}

/// Record counts by upload status
async fn video_stats(State(state): State<AppState>) -> ApiResult<Json<VideoStats>> {
    Ok(Json(state.store.get_stats().await?))
}

async fn storage_quota(State(state): State<AppState>) -> Json<StorageQuota> {
    Json(state.store.get_storage_quota().await)
}

async fn list_queue(State(state): State<AppState>) -> ApiResult<Json<Vec<QueueJob>>> {
    Ok(Json(state.queue.list_jobs().await?))
}

/// Serve the control API until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting control API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendPreference, QueueConfig, RetentionPolicy, StorageConfig};
    use crate::database::Database;
    use crate::models::VideoStatus;
    use crate::scheduler::{ManualClock, ManualScheduler};
    use crate::uploader::MockUploader;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Utc;
    use tower::ServiceExt;

    async fn test_state(uploader: MockUploader) -> AppState {
        let config = StorageConfig {
            backend: BackendPreference::Database,
            quota_bytes: 1000,
            ..Default::default()
        };
        let store = Arc::new(VideoStore::new(Database::in_memory().await.unwrap(), config));
        store.initialize().await.unwrap();

        let queue = Arc::new(UploadQueue::new(
            store.clone(),
            Arc::new(uploader),
            Arc::new(ManualClock::new(Utc::now())),
            Arc::new(ManualScheduler::new()),
            &QueueConfig::default(),
            RetentionPolicy::Keep,
        ));

        AppState { store, queue }
    }

    fn router(state: AppState) -> Router {
        create_router(state, &ApiConfig::default())
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    fn put_chunk(id: &str, first: bool, data: &'static [u8]) -> Request<Body> {
        Request::put(format!("/videos/{id}/chunks?first={first}"))
            .body(Body::from(data))
            .unwrap()
    }

    fn finalize(id: &str) -> Request<Body> {
        Request::post(format!("/videos/{id}/finalize"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"filename":"clip.webm","mime_type":"video/webm","duration_seconds":3.0}"#,
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(test_state(MockUploader::new()).await);
        let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["backend"], "blob_table");
    }

    #[tokio::test]
    async fn test_chunks_then_finalize_enqueues() {
        let state = test_state(MockUploader::new()).await;
        let app = router(state.clone());

        assert_eq!(send(&app, put_chunk("v1", true, b"ab")).await.0, StatusCode::NO_CONTENT);
        assert_eq!(send(&app, put_chunk("v1", false, b"cd")).await.0, StatusCode::NO_CONTENT);

        let (status, body) = send(&app, finalize("v1")).await;
        assert_eq!(status, StatusCode::CREATED);
        let record: VideoRecord = serde_json::from_slice(&body).unwrap();
        assert_eq!(record.status, VideoStatus::Pending);
        assert_eq!(record.size_bytes, 4);

        let (status, body) = send(
            &app,
            Request::get("/videos/v1/payload").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"abcd");

        let (_, body) = send(&app, Request::get("/queue").body(Body::empty()).unwrap()).await;
        let jobs: Vec<QueueJob> = serde_json::from_slice(&body).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].video_id, "v1");
    }

    #[tokio::test]
    async fn test_finalize_without_chunks_is_not_found() {
        let app = router(test_state(MockUploader::new()).await);
        let (status, body) = send(&app, finalize("ghost")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code, "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_video_stats() {
        let app = router(test_state(MockUploader::new()).await);
        send(&app, put_chunk("v1", true, b"abc")).await;
        send(&app, finalize("v1")).await;
        send(&app, put_chunk("v2", true, b"defgh")).await;
        send(&app, finalize("v2")).await;

        let (status, body) = send(&app, Request::get("/videos/stats").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);

        let stats: VideoStats = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats.total_videos, 2);
        assert_eq!(stats.total_bytes, 8);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn test_missing_video() {
        let app = router(test_state(MockUploader::new()).await);
        let (status, _) = send(&app, Request::get("/videos/nope").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_retry_uploads_and_delete_removes() {
        let mut uploader = MockUploader::new();
        uploader.expect_upload().times(1).returning(|_, _| Ok(()));
        let app = router(test_state(uploader).await);

        send(&app, put_chunk("v1", true, b"data")).await;
        send(&app, finalize("v1")).await;

        let (status, body) = send(
            &app,
            Request::post("/videos/v1/retry").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let summary: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(summary["succeeded"], 1);

        let (_, body) = send(&app, Request::get("/videos").body(Body::empty()).unwrap()).await;
        let records: Vec<VideoRecord> = serde_json::from_slice(&body).unwrap();
        assert_eq!(records[0].status, VideoStatus::Completed);

        let (status, _) = send(
            &app,
            Request::delete("/videos/v1").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&app, Request::get("/videos/v1").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_retry_failed_counts() {
        let mut uploader = MockUploader::new();
        uploader.expect_upload().returning(|_, _| Ok(()));
        let app = router(test_state(uploader).await);

        send(&app, put_chunk("v1", true, b"data")).await;
        send(&app, finalize("v1")).await;

        let (status, body) = send(
            &app,
            Request::post("/videos/retry-failed").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let response: RetryAllResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(response.retried, 1);
    }

    #[tokio::test]
    async fn test_storage_quota() {
        let app = router(test_state(MockUploader::new()).await);
        send(&app, put_chunk("v1", true, b"0123456789")).await;

        let (status, body) = send(
            &app,
            Request::get("/storage/quota").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let quota: StorageQuota = serde_json::from_slice(&body).unwrap();
        assert_eq!(quota.usage_bytes, 10);
        assert_eq!(quota.quota_bytes, 1000);
    }

    #[test]
    fn test_error_status_mapping() {
        let status = |e: StoreError| ApiError(e).into_response().status();

        assert_eq!(status(StoreError::PayloadNotFound("v".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status(StoreError::StorageUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(StoreError::write_rejected("v", "disk full")),
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(status(StoreError::AttemptsExhausted(5)), StatusCode::BAD_GATEWAY);
    }
}
