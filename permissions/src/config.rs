use crate::dispatch::BLOBS_PER_CHUNK;
use serde::Deserialize;
use shared::auth::TokenConfig;
use thiserror::Error;
use url::Url;

pub const STORAGE_URL: &str = "https://storage.googleapis.com";

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("blobs_per_chunk cannot be 0")]
    ZeroChunkSize,

    #[error("max_in_flight_publishes cannot be 0")]
    ZeroInFlight,

    #[error("Empty worker topic")]
    EmptyWorkerTopic,

    #[error("Empty bucket name")]
    EmptyBucket,

    #[error("Empty download role")]
    EmptyRole,

    #[error("expiry_days must be positive")]
    InvalidExpiry,
}

fn default_blobs_per_chunk() -> usize {
    BLOBS_PER_CHUNK
}

fn default_max_in_flight() -> usize {
    1
}

fn default_expiry_days() -> i64 {
    7
}

fn default_storage_url() -> Url {
    Url::parse(STORAGE_URL).expect("storage URL is a valid absolute URL")
}

/// Bucket access settings
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Acl {
    /// Bucket holding the downloadable blobs
    pub bucket: String,
    /// IAM role bound to grantees (e.g. a custom download-only role)
    pub role: String,
    /// Days until a grant expires
    #[serde(default = "default_expiry_days")]
    pub expiry_days: i64,
    /// Base URL of the Cloud Storage JSON API
    #[serde(default = "default_storage_url")]
    pub storage_url: Url,
    #[serde(default)]
    pub auth: TokenConfig,
}

/// Permission grant configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Topic the per-chunk worker messages are published to
    pub worker_topic: String,
    /// Number of blobs per worker message
    #[serde(default = "default_blobs_per_chunk")]
    pub blobs_per_chunk: usize,
    /// Worker messages awaiting acknowledgement at once. 1 publishes
    /// sequentially.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_publishes: usize,
    /// Recipients of developer alerts when a grant request fails
    #[serde(default)]
    pub alert_recipients: Vec<String>,
    /// Deployment name shown in alert subjects
    #[serde(default)]
    pub env: String,
    pub acl: Acl,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.blobs_per_chunk == 0 {
            return Err(ValidationError::ZeroChunkSize);
        }
        if self.max_in_flight_publishes == 0 {
            return Err(ValidationError::ZeroInFlight);
        }
        if self.worker_topic.is_empty() {
            return Err(ValidationError::EmptyWorkerTopic);
        }
        if self.acl.bucket.is_empty() {
            return Err(ValidationError::EmptyBucket);
        }
        if self.acl.role.is_empty() {
            return Err(ValidationError::EmptyRole);
        }
        if self.acl.expiry_days <= 0 {
            return Err(ValidationError::InvalidExpiry);
        }
        Ok(())
    }
}
