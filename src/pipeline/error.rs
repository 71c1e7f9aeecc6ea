//! Error taxonomy of the analysis pipeline.
//!
//! `InvocationError` is per record and never aborts a run; it is counted,
//! retried, and reported by id. `PipelineError` is fatal and only raised
//! before the first service call.

use serde::Serialize;
use thiserror::Error;

use super::llm::ServiceError;

/// Coarse tag used by retry policy and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationErrorKind {
    SchemaViolation,
    ServiceError,
}

/// Failure of one stage invocation for one record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    /// The completion arrived but does not have the declared shape.
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// Transport, timeout or upstream failure.
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
}

impl InvocationError {
    pub fn kind(&self) -> InvocationErrorKind {
        match self {
            Self::SchemaViolation(_) => InvocationErrorKind::SchemaViolation,
            Self::Service(_) => InvocationErrorKind::ServiceError,
        }
    }

    /// A schema violation may not recur on a fresh sample; service errors
    /// defer to the service's own classification.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SchemaViolation(_) => true,
            Self::Service(e) => e.is_retryable(),
        }
    }
}

/// Fatal, run-level errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn kind_tags_follow_variant() {
        let schema = InvocationError::SchemaViolation("missing key".into());
        assert_eq!(schema.kind(), InvocationErrorKind::SchemaViolation);
        let service = InvocationError::from(ServiceError::Timeout(Duration::from_secs(5)));
        assert_eq!(service.kind(), InvocationErrorKind::ServiceError);
    }

    #[test]
    fn schema_violations_are_retryable() {
        assert!(InvocationError::SchemaViolation("x".into()).is_retryable());
    }

    #[test]
    fn auth_failure_is_terminal() {
        let err = InvocationError::from(ServiceError::Api {
            status: 401,
            body: "invalid api key".into(),
        });
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("401"));
    }
}
