//! Error types for hiri-core.
//!
//! Every failure to obtain a page from the sensor API surfaces as an
//! [`UpstreamError`]. The client itself never decides on a long-term recovery
//! strategy; it only retries a single request a bounded number of times (see
//! [`crate::with_retry`]). Callers such as the collector fall back to their
//! poll [`crate::Backoff`] when an error escapes.
//!
//! | Variant | Retryable |
//! |---------|-----------|
//! | [`UpstreamError::Connect`] | yes |
//! | [`UpstreamError::Timeout`] | yes |
//! | [`UpstreamError::Status`] | 429 and 5xx only |
//! | [`UpstreamError::Request`] | yes |
//! | [`UpstreamError::Decode`] | no |
//! | [`UpstreamError::InvalidConfig`] | no |

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when talking to the upstream sensor API.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpstreamError {
    /// The upstream host could not be reached.
    #[error("Upstream not reachable at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A request exceeded its deadline.
    #[error("Upstream request timed out after {0:?}")]
    Timeout(Duration),

    /// The upstream answered with a non-success HTTP status.
    #[error("Upstream returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Any other transport-level failure.
    #[error("Upstream request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The response body was not the expected JSON envelope.
    #[error("Undecodable upstream payload: {0}")]
    Decode(String),

    /// The client was configured with unusable settings.
    #[error("Invalid upstream configuration: {0}")]
    InvalidConfig(String),
}

impl UpstreamError {
    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::Timeout(_) | Self::Request(_) => true,
            Self::Status { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Decode(_) | Self::InvalidConfig(_) => false,
        }
    }
}

/// Result type alias using hiri-core's error type.
pub type Result<T> = std::result::Result<T, UpstreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> UpstreamError {
        UpstreamError::Status {
            status: code,
            message: "test".to_string(),
        }
    }

    #[test]
    fn test_status_retry_classification() {
        assert!(status(429).is_retryable());
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(404).is_retryable());
    }

    #[test]
    fn test_non_retryable_kinds() {
        assert!(UpstreamError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!UpstreamError::Decode("bad json".to_string()).is_retryable());
        assert!(!UpstreamError::InvalidConfig("no url".to_string()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = status(502);
        assert_eq!(err.to_string(), "Upstream returned HTTP 502: test");
    }
}
