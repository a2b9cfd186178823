//! Access to the cloud platform's HTTP API.

use async_trait::async_trait;
use thiserror::Error;

pub mod client;
pub mod job;
pub mod signer;

pub use client::ApiClient;
pub use job::{Job, JobId, JobStatus};

/// Command used to list async jobs.
pub const LIST_ASYNC_JOBS: &str = "listAsyncJobs";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("platform returned error {code}: {text}")]
    Platform { code: i64, text: String },
    #[error("request to the platform failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("platform answered with HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("platform response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("platform response has no `{0}` envelope")]
    MissingEnvelope(String),
    #[error("invalid job record: {0}")]
    InvalidJob(String),
    #[error("failed signing request: {0}")]
    Signing(String),
    #[error("invalid request url `{0}`")]
    Url(String),
}

/// Something that can list the platform's async jobs.
#[async_trait]
pub trait JobSource: std::fmt::Debug + Send + Sync {
    async fn list_jobs(&self) -> Result<Vec<Job>, ApiError>;
}
