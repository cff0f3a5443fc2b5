//! Error taxonomy for adapter invocations.
//!
//! Every upstream failure is folded into one of six kinds. The kind decides
//! three things downstream: whether the dispatcher may retry on another
//! candidate, whether the failure counts against the provider's circuit
//! breaker, and which HTTP status the gateway surfaces.

use thiserror::Error;

/// Failure of a single adapter operation against one provider.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Upstream failed in a way that is expected to be temporary.
    /// Retryable on the next candidate; counts against the breaker.
    #[error("transient upstream failure: {message}")]
    TransientUpstream { message: String },

    /// Upstream failed in a way retrying will not fix (malformed response,
    /// protocol violation). Not retried; counts against the breaker.
    #[error("permanent upstream failure: {message}")]
    PermanentUpstream { message: String },

    /// The caller's request was rejected by the upstream as invalid.
    /// Propagated as-is; never retried, never counted against the breaker.
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// The operation exceeded its deadline. Retryable; counts against
    /// the breaker.
    #[error("upstream deadline exceeded")]
    Timeout,

    /// The caller went away or the request was administratively aborted.
    #[error("request cancelled")]
    Cancelled,

    /// The provider's configuration is unusable (bad URL, missing
    /// credential, disallowed image). Marks the provider unhealthy.
    #[error("provider misconfigured: {message}")]
    ConfigError { message: String },
}

impl AdapterError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientUpstream {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::PermanentUpstream {
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Whether the dispatcher may advance to the next candidate provider.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientUpstream { .. } | Self::Timeout)
    }

    /// Whether this failure counts toward the provider's breaker threshold.
    /// Only failures where the upstream was actually contacted qualify.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Self::TransientUpstream { .. }
                | Self::PermanentUpstream { .. }
                | Self::Timeout
                | Self::ConfigError { .. }
        )
    }

    /// Map an upstream HTTP status to an error kind.
    ///
    /// 408, 429 and all 5xx are transient; every other 4xx is the caller's
    /// fault and is propagated as a bad request.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            408 | 429 => Self::transient(message),
            500..=599 => Self::transient(message),
            400..=499 => Self::bad_request(message),
            _ => Self::permanent(message),
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            // Connect and read failures are transient per the retry policy.
            Self::transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        // An unparsable upstream body will not parse on retry either.
        Self::permanent(format!("invalid upstream payload: {err}"))
    }
}
