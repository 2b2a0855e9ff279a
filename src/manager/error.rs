//! Error types surfaced by the manager client to its callers.

use std::time::Duration;

use thiserror::Error;

/// Errors the manager client can surface above the retry layer.
///
/// Every other error the underlying transport can produce (connection
/// errors, unexpected status codes not covered below, deserialization
/// surprises that aren't plain malformed JSON) coerces to [`ManagerError::Transient`]
/// so the retry layer gets a chance at it; see [`crate::manager::retry::classify_error`].
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The requested resource does not exist (HTTP 404).
    #[error("not found: {resource}")]
    NotFound {
        /// What was being requested, e.g. `"episode_file/42"`.
        resource: String,
    },

    /// The manager rejected the API key (HTTP 401/403).
    #[error("unauthorized calling {endpoint}")]
    Unauthorized {
        /// The endpoint that rejected the request.
        endpoint: String,
    },

    /// A transient failure: connection error, timeout, 5xx, or 429.
    #[error("transient error calling {endpoint}: {message}")]
    Transient {
        /// The endpoint that failed.
        endpoint: String,
        /// Human-readable detail for logs.
        message: String,
        /// The server's requested backoff, parsed from a 429's `Retry-After`
        /// header. `None` for every other transient cause.
        retry_after: Option<Duration>,
    },

    /// A non-retryable server error (4xx other than 401/403/404/429).
    #[error("permanent server error calling {endpoint}: HTTP {status}")]
    PermanentServerError {
        /// The endpoint that failed.
        endpoint: String,
        /// The HTTP status code returned.
        status: u16,
    },

    /// The response body could not be parsed into the expected shape.
    #[error("malformed response from {endpoint}: {message}")]
    Malformed {
        /// The endpoint that returned an unparseable body.
        endpoint: String,
        /// Parse error detail for logs.
        message: String,
    },

    /// The queue item was already gone before a remove/import call reached
    /// it. Per spec §7 this is treated as a successful no-op by callers, but
    /// the client still surfaces it distinctly so the engine can log it as
    /// such rather than as a generic success.
    #[error("conflict calling {endpoint}: item already gone")]
    Conflict {
        /// The endpoint that reported the conflict.
        endpoint: String,
    },
}

impl ManagerError {
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound { resource: resource.into() }
    }

    #[must_use]
    pub fn unauthorized(endpoint: impl Into<String>) -> Self {
        Self::Unauthorized { endpoint: endpoint.into() }
    }

    #[must_use]
    pub fn transient(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient { endpoint: endpoint.into(), message: message.into(), retry_after: None }
    }

    /// A transient failure carrying a server-supplied `Retry-After` delay,
    /// e.g. a 429 response.
    #[must_use]
    pub fn rate_limited(
        endpoint: impl Into<String>,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self::Transient { endpoint: endpoint.into(), message: message.into(), retry_after }
    }

    #[must_use]
    pub fn permanent(endpoint: impl Into<String>, status: u16) -> Self {
        Self::PermanentServerError { endpoint: endpoint.into(), status }
    }

    #[must_use]
    pub fn malformed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed { endpoint: endpoint.into(), message: message.into() }
    }

    #[must_use]
    pub fn conflict(endpoint: impl Into<String>) -> Self {
        Self::Conflict { endpoint: endpoint.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display_includes_resource() {
        let err = ManagerError::not_found("episode_file/42");
        assert!(err.to_string().contains("episode_file/42"));
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = ManagerError::rate_limited("/queue", "rate limited", Some(Duration::from_secs(30)));
        match err {
            ManagerError::Transient { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(30)));
            }
            other => panic!("expected Transient, got {other:?}"),
        }
    }
}
