pub mod mock;
pub mod ollama;
pub mod openai;
pub mod types;

pub use mock::*;
pub use ollama::*;
pub use openai::*;
pub use types::*;

use std::time::Duration;

use thiserror::Error;

/// Transport-level failure of a single completion call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("LLM service is not reachable at {0}")]
    Connection(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM service returned error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),

    #[error("LLM service returned an empty completion")]
    EmptyResponse,
}

impl ServiceError {
    /// Client-side rejections (bad request, auth, unknown model) fail the
    /// same way on every attempt. Everything else may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => !matches!(status, 400 | 401 | 403 | 404 | 422),
            _ => true,
        }
    }
}

/// Map a reqwest failure to a service error, keeping the timeout distinct.
pub(crate) fn map_transport_error(
    err: reqwest::Error,
    base_url: &str,
    timeout: Duration,
) -> ServiceError {
    if err.is_timeout() {
        ServiceError::Timeout(timeout)
    } else if err.is_connect() {
        ServiceError::Connection(base_url.to_string())
    } else {
        ServiceError::HttpClient(err.to_string())
    }
}
