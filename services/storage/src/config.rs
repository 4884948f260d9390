use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the storage service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Local persistence configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Upload retry queue configuration
    #[serde(default)]
    pub queue: QueueConfig,
    /// What happens to payloads after a successful upload
    #[serde(default)]
    pub retention: RetentionConfig,
    /// S3 upload target
    pub s3: S3Config,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Which payload backend to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// Probe the filesystem, fall back to the database
    #[default]
    Auto,
    /// Filesystem only; initialization fails if unusable
    Filesystem,
    /// Always store payloads as database blobs
    Database,
}

/// Local persistence configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding payload files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// SQLite URL for metadata, jobs and blob fallback
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default)]
    pub backend: BackendPreference,
    /// Capacity reported by quota introspection (0 = unknown)
    #[serde(default)]
    pub quota_bytes: u64,
}

/// Upload retry queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Attempt ceiling before a video is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Period of the processing tick in seconds
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Upper bound on a single upload call in seconds
    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,
}

/// Post-upload payload retention
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep uploaded payloads forever
    #[default]
    Keep,
    /// Remove the payload as soon as the upload succeeds
    DeleteOnSuccess,
    /// Remove uploaded payloads after the given number of days
    DeleteAfterDays(u32),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetentionConfig {
    #[serde(default)]
    pub policy: RetentionPolicy,
}

/// S3 upload target configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for uploaded videos
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Multipart upload threshold in bytes (8MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (8MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// API configuration for the control surface
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Largest accepted request body (one chunk) in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "reelsafe-storage".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/payloads")
}

fn default_database_url() -> String {
    "sqlite://data/reelsafe.db".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_tick_interval_secs() -> u64 {
    5
}

fn default_upload_timeout_secs() -> u64 {
    300
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_part_size() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/reelsafe").required(false))
            .add_source(config::File::with_name("/etc/reelsafe/reelsafe").required(false))
            // Override with environment variables
            // REELSAFE__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("REELSAFE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.storage.database_url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.database_url".to_string(),
            ));
        }
        if !self.storage.database_url.starts_with("sqlite:") {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.database_url".to_string(),
                message: "URL must start with sqlite:".to_string(),
            });
        }

        if self.queue.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "queue.max_attempts".to_string(),
                message: "Must allow at least one attempt".to_string(),
            });
        }
        if self.queue.tick_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "queue.tick_interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }
        if self.queue.upload_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "queue.upload_timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        if self.s3.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField("s3.bucket".to_string()));
        }
        // S3 rejects multipart parts under 5MB except the last one
        if self.s3.part_size_bytes < 5 * 1024 * 1024 {
            return Err(ConfigValidationError::InvalidValue {
                field: "s3.part_size_bytes".to_string(),
                message: "Part size must be at least 5MB".to_string(),
            });
        }

        Ok(())
    }
}

impl QueueConfig {
    /// Get backoff base delay as Duration
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Get processing tick period as Duration
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Get upload timeout as Duration
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_url: default_database_url(),
            backend: BackendPreference::default(),
            quota_bytes: 0,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            tick_interval_secs: default_tick_interval_secs(),
            upload_timeout_secs: default_upload_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
