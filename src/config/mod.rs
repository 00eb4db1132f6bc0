use serde::Deserialize;
use std::time::Duration;

use crate::services::prediction::PollPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Scrape address for the worker's own Prometheus listener
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,

    /// PostgreSQL connection string (catalog, source images, markers)
    pub database_url: String,

    /// Pool size per process
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// Redis connection string for job queue and batch progress
    pub redis_url: String,

    /// API token for the hosted prediction service
    pub replicate_api_token: String,

    /// Base URL of the prediction service
    #[serde(default = "default_replicate_base_url")]
    pub replicate_base_url: String,

    /// Grounding DINO model version used for detection
    #[serde(default = "default_detection_model")]
    pub detection_model: String,

    /// Vision LLM version used for identification and match adjudication
    #[serde(default = "default_identification_model")]
    pub identification_model: String,

    /// Image model used for best-effort enhancement
    #[serde(default = "default_enhancement_model")]
    pub enhancement_model: String,

    /// UPCitemdb key; the trial endpoint is used when absent
    #[serde(default)]
    pub upcitemdb_api_key: Option<String>,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// Prediction status poll interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up waiting on one prediction after this long
    #[serde(default = "default_prediction_timeout_secs")]
    pub prediction_timeout_secs: u64,

    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f64,

    #[serde(default = "default_crop_padding")]
    pub crop_padding: u32,

    #[serde(default = "default_min_crop_size")]
    pub min_crop_size: u32,

    /// Pause between the full-name and brand-only open database searches
    #[serde(default = "default_lookup_delay_ms")]
    pub lookup_delay_ms: u64,

    /// Simultaneous enhancement calls
    #[serde(default = "default_enhancement_concurrency")]
    pub enhancement_concurrency: usize,

    /// Image jobs a worker runs at once
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_max_job_retries")]
    pub max_job_retries: u32,

    /// Delay before the batch completion check runs
    #[serde(default = "default_batch_grace_secs")]
    pub batch_grace_secs: u64,

    /// Completion re-checks before a batch is forced to completed
    #[serde(default = "default_max_completion_checks")]
    pub max_completion_checks: u32,

    /// Lifetime of batch progress records
    #[serde(default = "default_progress_ttl_secs")]
    pub progress_ttl_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9091".to_string()
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_replicate_base_url() -> String {
    "https://api.replicate.com/v1".to_string()
}

fn default_detection_model() -> String {
    "efd10a8ddc57ea28773327e881ce95e20cc1d734c589f7dd01d2036921ed78aa".to_string()
}

fn default_identification_model() -> String {
    "bfb7df9586ae4fafa00a593d8dc4868698f72cf9d695da28b8c8a70f88e876ba".to_string()
}

fn default_enhancement_model() -> String {
    "google/nano-banana-pro".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_prediction_timeout_secs() -> u64 {
    300
}

fn default_iou_threshold() -> f64 {
    0.5
}

fn default_crop_padding() -> u32 {
    5
}

fn default_min_crop_size() -> u32 {
    30
}

fn default_lookup_delay_ms() -> u64 {
    1000
}

fn default_enhancement_concurrency() -> usize {
    4
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_max_job_retries() -> u32 {
    3
}

fn default_batch_grace_secs() -> u64 {
    30
}

fn default_max_completion_checks() -> u32 {
    20
}

fn default_progress_ttl_secs() -> u64 {
    3600
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make every job fail later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("DATABASE_URL", &self.database_url),
            ("REDIS_URL", &self.redis_url),
            ("REPLICATE_API_TOKEN", &self.replicate_api_token),
            ("R2_BUCKET", &self.r2_bucket),
            ("R2_ENDPOINT", &self.r2_endpoint),
            ("R2_ACCESS_KEY", &self.r2_access_key),
            ("R2_SECRET_KEY", &self.r2_secret_key),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }

        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(ConfigError::Invalid(
                "IOU_THRESHOLD",
                format!("{} is outside 0..=1", self.iou_threshold),
            ));
        }
        if self.enhancement_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "ENHANCEMENT_CONCURRENCY",
                "must be at least 1".to_string(),
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "WORKER_CONCURRENCY",
                "must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "POLL_INTERVAL_MS",
                "must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn prediction_timeout(&self) -> Duration {
        Duration::from_secs(self.prediction_timeout_secs)
    }

    pub fn batch_grace(&self) -> Duration {
        Duration::from_secs(self.batch_grace_secs)
    }

    pub fn lookup_delay(&self) -> Duration {
        Duration::from_millis(self.lookup_delay_ms)
    }

    pub fn progress_ttl(&self) -> Duration {
        Duration::from_secs(self.progress_ttl_secs)
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.poll_interval(),
            timeout: self.prediction_timeout(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}
