use std::time::Duration;
use thiserror::Error;

/// Errors produced by the deliberation pipeline and its components.
#[derive(Error, Debug)]
pub enum QuorumError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization or parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Transcript store failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by [`Upstream`](crate::upstream::Upstream) implementations when
    /// the provider returns a non-success status code. The `retry_after` field
    /// is populated from the `Retry-After` response header when present.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// The principal's balance cannot cover the requested reservation.
    #[error("insufficient credits: need {required}, have {available}")]
    InsufficientCredits {
        /// Credits the operation needed.
        required: i64,
        /// Credits the principal actually had.
        available: i64,
    },

    /// Every panelist in the pool failed to respond during stage 1.
    #[error("all panelists failed to respond")]
    AllPanelistsFailed,

    /// The requested record does not exist or is owned by another principal.
    #[error("not found: {0}")]
    NotFound(String),

    /// Request rejected before any work began (size, shape, or mode tag).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The run was cancelled via the cancellation flag.
    #[error("run was cancelled")]
    Cancelled,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for QuorumError {
    fn from(err: anyhow::Error) -> Self {
        QuorumError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QuorumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_credits_display() {
        let err = QuorumError::InsufficientCredits {
            required: 3,
            available: 1,
        };
        assert_eq!(err.to_string(), "insufficient credits: need 3, have 1");
    }

    #[test]
    fn test_http_error_display() {
        let err = QuorumError::HttpError {
            status: 429,
            body: "rate limited".into(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.to_string(), "HTTP 429: rate limited");
    }

    #[test]
    fn test_anyhow_bridge() {
        let err: QuorumError = anyhow::anyhow!("upstream misbehaved").into();
        assert!(matches!(err, QuorumError::Other(_)));
    }
}
