//! Gateway error types and the wire-level error envelope.
//!
//! Every failure leaving the gateway is shaped as
//! `{"error": {"message", "type", "code", "request_id"?, "details"?}}`
//! with the HTTP status from the kind table. Adapter and dispatch errors
//! fold into this enum at the handler boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crossbar_adapters::dispatch::DispatchError;
use crossbar_adapters::error::AdapterError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{message}")]
    InvalidApiKey { message: String },

    #[error("{message}")]
    Forbidden { message: String },

    #[error("{message}")]
    InvalidRequest { message: String },

    #[error("model {model} not found")]
    ModelNotFound { model: String },

    #[error("{message}")]
    RateLimited { message: String, retry_after: u64 },

    #[error("gateway is at capacity")]
    AtCapacity { retry_after: u64 },

    #[error("{message}")]
    Upstream { message: String },

    #[error("upstream deadline exceeded")]
    Timeout,

    #[error("request cancelled by client")]
    Cancelled,

    #[error("{message}")]
    Internal { message: String },
}

impl ApiError {
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidApiKey {
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidApiKey { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::AtCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            // 499: client closed the connection before the response.
            Self::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> (&'static str, &'static str) {
        match self {
            Self::InvalidApiKey { .. } => ("authentication_error", "invalid_api_key"),
            Self::Forbidden { .. } => ("permission_error", "model_access_denied"),
            Self::InvalidRequest { .. } => ("invalid_request_error", "invalid_request"),
            Self::ModelNotFound { .. } => ("invalid_request_error", "model_not_found"),
            Self::RateLimited { .. } => ("rate_limit_error", "rate_limit_exceeded"),
            Self::AtCapacity { .. } => ("overloaded_error", "rate_limit_exceeded"),
            Self::Upstream { .. } => ("upstream_error", "upstream_unavailable"),
            Self::Timeout => ("timeout_error", "upstream_unavailable"),
            Self::Cancelled => ("invalid_request_error", "invalid_request"),
            Self::Internal { .. } => ("internal_error", "internal_server_error"),
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::AtCapacity { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Render with the request id attached.
    pub fn into_response_with_id(self, request_id: Option<&str>) -> Response {
        let status = self.status();

        // The client is gone; there is nobody to shape a body for.
        if matches!(self, Self::Cancelled) {
            return status.into_response();
        }

        let (error_type, code) = self.kind();
        let mut error = json!({
            "message": self.to_string(),
            "type": error_type,
            "code": code,
        });
        if let Some(id) = request_id {
            error["request_id"] = json!(id);
        }
        if let Some(seconds) = self.retry_after() {
            error["details"] = json!({ "retry_after": seconds });
        }

        let mut response = (status, Json(json!({ "error": error }))).into_response();
        if let Some(seconds) = self.retry_after() {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.into_response_with_id(None)
    }
}

impl From<AdapterError> for ApiError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::BadRequest { message } => Self::InvalidRequest { message },
            AdapterError::Timeout => Self::Timeout,
            AdapterError::Cancelled => Self::Cancelled,
            AdapterError::TransientUpstream { message }
            | AdapterError::PermanentUpstream { message } => Self::Upstream { message },
            AdapterError::ConfigError { message } => Self::Internal { message },
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::ModelNotFound { model } => Self::ModelNotFound { model },
            DispatchError::AtCapacity => Self::AtCapacity { retry_after: 5 },
            DispatchError::Upstream(inner) => inner.into(),
        }
    }
}
