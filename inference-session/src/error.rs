//! Error taxonomy shared by the encrypted channel and the HTTP fallback.
//!
//! Every failure carries a stable [`ErrorCategory`] plus a human-readable
//! message. Retryable categories also expose a `retry_after` hint where the
//! host (or the local rate limiter) supplied one.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[cfg(feature = "typescript")]
use ts_rs::TS;

use crate::types::RateCategory;

/// Errors surfaced to callers of the protocol engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    /// Request failed local validation; nothing was sent.
    #[error("Validation failed on `{field}`: {message}")]
    ValidationFailed { field: String, message: String },

    /// Local admission control refused the request.
    #[error("Rate limit exceeded for {category:?}, retry after {retry_after:?}")]
    RateLimitExceeded {
        category: RateCategory,
        retry_after: Duration,
    },

    /// Host refused the prompt or output on safety grounds.
    #[error("Prompt blocked ({code}): {message}")]
    PromptBlocked { code: String, message: String },

    /// Host has no capacity or the model is not loaded.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Catch-all remote or transport failure.
    #[error("Generation failed: {message}")]
    GenerationFailed {
        code: Option<String>,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Local crypto or codec fault.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// No terminal frame arrived in time.
    #[error("Request timed out after {after:?}")]
    Timeout { after: Duration },

    /// Caller cancelled the request before it settled.
    #[error("Request cancelled")]
    Cancelled,
}

/// Stable category codes for [`ProtocolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(TS))]
#[cfg_attr(feature = "typescript", ts(export))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    ValidationFailed,
    RateLimitExceeded,
    PromptBlocked,
    ServiceUnavailable,
    GenerationFailed,
    EncryptionFailed,
    Timeout,
    Cancelled,
}

impl ErrorCategory {
    /// Wire/log code for this category.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::PromptBlocked => "PROMPT_BLOCKED",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::GenerationFailed => "GENERATION_FAILED",
            Self::EncryptionFailed => "ENCRYPTION_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl ProtocolError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn generation(message: impl Into<String>) -> Self {
        Self::GenerationFailed {
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ValidationFailed { .. } => ErrorCategory::ValidationFailed,
            Self::RateLimitExceeded { .. } => ErrorCategory::RateLimitExceeded,
            Self::PromptBlocked { .. } => ErrorCategory::PromptBlocked,
            Self::ServiceUnavailable(_) => ErrorCategory::ServiceUnavailable,
            Self::GenerationFailed { .. } => ErrorCategory::GenerationFailed,
            Self::EncryptionFailed(_) => ErrorCategory::EncryptionFailed,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Whether a fresh attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. } | Self::GenerationFailed { .. } | Self::Timeout { .. }
        )
    }

    /// Server or limiter supplied wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            Self::GenerationFailed { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Error codes a remote host may put in an inner `error` frame.
///
/// Unrecognized codes land in [`RemoteErrorCode::Unknown`] and map to a
/// retryable failure. Only the explicitly listed safety codes are treated
/// as non-retryable blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteErrorCode {
    PromptBlocked,
    ContentBlocked,
    NsfwContent,
    SafetyViolation,
    InvalidRequest,
    RateLimited,
    ServiceUnavailable,
    ModelNotLoaded,
    GenerationFailed,
    Unknown(String),
}

impl RemoteErrorCode {
    pub fn parse(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "PROMPT_BLOCKED" => Self::PromptBlocked,
            "CONTENT_BLOCKED" => Self::ContentBlocked,
            "NSFW_CONTENT" => Self::NsfwContent,
            "SAFETY_VIOLATION" => Self::SafetyViolation,
            "INVALID_REQUEST" | "VALIDATION_ERROR" => Self::InvalidRequest,
            "RATE_LIMITED" | "RATE_LIMIT_EXCEEDED" => Self::RateLimited,
            "SERVICE_UNAVAILABLE" => Self::ServiceUnavailable,
            "MODEL_NOT_LOADED" => Self::ModelNotLoaded,
            "GENERATION_FAILED" => Self::GenerationFailed,
            _ => Self::Unknown(code.to_string()),
        }
    }

    pub fn is_safety_related(&self) -> bool {
        matches!(
            self,
            Self::PromptBlocked | Self::ContentBlocked | Self::NsfwContent | Self::SafetyViolation
        )
    }

    /// Map into the local taxonomy.
    ///
    /// `retry_after` is the host's hint in seconds, when it sent one.
    pub fn into_error(self, raw_code: &str, message: String, retry_after: Option<f64>) -> ProtocolError {
        let hint = retry_after.and_then(retry_hint);

        match self {
            code if code.is_safety_related() => ProtocolError::PromptBlocked {
                code: raw_code.to_string(),
                message,
            },
            Self::InvalidRequest => ProtocolError::validation("remote", message),
            Self::RateLimited => ProtocolError::RateLimitExceeded {
                category: RateCategory::Remote,
                retry_after: hint.unwrap_or(Duration::from_secs(1)),
            },
            Self::ServiceUnavailable | Self::ModelNotLoaded => {
                ProtocolError::ServiceUnavailable(message)
            }
            _ => ProtocolError::GenerationFailed {
                code: Some(raw_code.to_string()),
                message,
                retry_after: hint,
            },
        }
    }
}

/// Convert a host-supplied delay in seconds.
///
/// Negative, non-finite or out-of-range values are discarded.
pub fn retry_hint(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

/// Map a remote `error_code` string straight into a [`ProtocolError`].
pub fn map_remote_error(code: Option<&str>, message: Option<&str>, retry_after: Option<f64>) -> ProtocolError {
    let message = message.unwrap_or("remote host reported an error").to_string();
    match code {
        Some(code) => RemoteErrorCode::parse(code).into_error(code, message, retry_after),
        None => ProtocolError::GenerationFailed {
            code: None,
            message,
            retry_after: retry_after.and_then(retry_hint),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_categories() {
        assert!(ProtocolError::generation("boom").is_retryable());
        assert!(ProtocolError::Timeout { after: Duration::from_secs(1) }.is_retryable());
        assert!(!ProtocolError::validation("prompt", "empty").is_retryable());
        assert!(!ProtocolError::ServiceUnavailable("busy".into()).is_retryable());
        assert!(!ProtocolError::EncryptionFailed("tag".into()).is_retryable());
        assert!(!ProtocolError::Cancelled.is_retryable());
    }

    #[test]
    fn test_safety_codes_are_not_retryable() {
        for code in ["PROMPT_BLOCKED", "content_blocked", "NSFW_CONTENT", "SAFETY_VIOLATION"] {
            let err = map_remote_error(Some(code), Some("nope"), None);
            assert_eq!(err.category(), ErrorCategory::PromptBlocked, "{code}");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_unknown_code_fails_safe() {
        let err = map_remote_error(Some("GPU_ON_FIRE"), Some("melted"), Some(2.0));
        assert_eq!(err.category(), ErrorCategory::GenerationFailed);
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_out_of_range_hint_discarded() {
        let err = map_remote_error(Some("GPU_ON_FIRE"), Some("melted"), Some(1e20));
        assert_eq!(err.category(), ErrorCategory::GenerationFailed);
        assert_eq!(err.retry_after(), None);

        let limited = map_remote_error(Some("RATE_LIMITED"), None, Some(f64::MAX));
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(1)));

        assert_eq!(map_remote_error(None, None, Some(-3.0)).retry_after(), None);
        assert_eq!(retry_hint(f64::NAN), None);
        assert_eq!(retry_hint(0.25), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_known_codes() {
        assert_eq!(
            map_remote_error(Some("MODEL_NOT_LOADED"), None, None).category(),
            ErrorCategory::ServiceUnavailable
        );
        assert_eq!(
            map_remote_error(Some("INVALID_REQUEST"), None, None).category(),
            ErrorCategory::ValidationFailed
        );
        let limited = map_remote_error(Some("RATE_LIMITED"), None, Some(5.0));
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_category_codes() {
        assert_eq!(ErrorCategory::RateLimitExceeded.code(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(
            serde_json::to_string(&ErrorCategory::PromptBlocked).unwrap(),
            "\"PROMPT_BLOCKED\""
        );
    }
}
