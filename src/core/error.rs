use std::time::Duration;
use thiserror::Error;

/// Failure classes a pipeline run can surface to its caller.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required upstream artifact is absent. Fatal for the unit of work.
    #[error("required input missing: {0}")]
    InputMissing(String),

    /// A collaborator answered, but not with anything usable for `stage`.
    #[error("{stage}: no usable result ({reason})")]
    Validation { stage: String, reason: String },

    /// A heavy collaborator could not be brought up.
    #[error("service '{name}' unavailable: {reason}")]
    ServiceUnavailable { name: String, reason: String },
}

impl PipelineError {
    pub fn input_missing(what: impl Into<String>) -> Self {
        Self::InputMissing(what.into())
    }

    pub fn validation(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            stage: stage.into(),
            reason: reason.into(),
        }
    }
}

/// Transport-level failures reported by collaborator clients.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("transport error: {0}")]
    Transport(String),

    /// Quota or throttling; `retry_after` carries the provider's wait hint.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The provider refused the request outright (blocked content, bad key).
    /// Retrying will not help.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Returns true when `err` (or anything in its chain) is a [`PipelineError::InputMissing`].
pub fn is_input_missing(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::InputMissing(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_missing_is_detected_through_context() {
        let err = anyhow::Error::new(PipelineError::input_missing("chapter text"))
            .context("loading chapter");
        assert!(is_input_missing(&err));

        let other = anyhow::Error::new(PipelineError::validation("script", "empty"));
        assert!(!is_input_missing(&other));
    }
}
