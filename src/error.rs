use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::messages::anthropic;

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// Bridge errors with appropriate HTTP status codes and Anthropic error types.
///
/// Converters never raise these for content they can degrade in place (see
/// the content transcoder); only the dispatcher and the inbound validation
/// layer construct these.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Malformed request body, invalid role sequence, tool-flow violation.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or invalid upstream credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Caller or backend lacks permission for the requested operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Requested model is not known to the active backend.
    #[error("{0}")]
    ModelNotFound(String),

    /// Upstream rejected the request for rate-limit reasons.
    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded { message: String },

    /// Upstream is temporarily overloaded; safe to retry later.
    #[error("Upstream overloaded: {0}")]
    Overloaded(String),

    /// Streaming requested but the active backend cannot provide it.
    #[error("Streaming is not supported by the active backend.")]
    StreamingNotSupported,

    /// Upstream returned a non-success status this crate doesn't special-case.
    #[error("Upstream error ({status}): {message}")]
    UpstreamStatusError { status: u16, message: String },

    /// Transport-level failure: timeout, connection reset, DNS, TLS, etc.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error emitted mid-stream after a partial response was already sent.
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Internal error. `Some(message)` came from a provider and is safe to
    /// show; `None` is an internal failure and must not leak details.
    #[error("Internal server error")]
    InternalError(Option<String>),
}

impl LlmError {
    /// HTTP status code for this error, per the error taxonomy.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::StreamingNotSupported => StatusCode::BAD_REQUEST,
            Self::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ConnectionError(_) => StatusCode::BAD_GATEWAY,
            Self::StreamError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UpstreamStatusError { status, .. } => match *status {
                400 => StatusCode::BAD_REQUEST,
                401 => StatusCode::UNAUTHORIZED,
                403 => StatusCode::FORBIDDEN,
                404 => StatusCode::NOT_FOUND,
                429 => StatusCode::TOO_MANY_REQUESTS,
                503 => StatusCode::SERVICE_UNAVAILABLE,
                500..=599 => StatusCode::BAD_GATEWAY,
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Anthropic error `type` discriminator for this error.
    pub fn error_type(&self) -> &str {
        match self {
            Self::InvalidRequest(_) | Self::StreamingNotSupported => "invalid_request_error",
            Self::AuthenticationFailed(_) => "authentication_error",
            Self::PermissionDenied(_) => "permission_error",
            Self::ModelNotFound(_) => "not_found_error",
            Self::RateLimitExceeded { .. } => "rate_limit_error",
            Self::Overloaded(_) => "overloaded_error",
            Self::ConnectionError(_) | Self::UpstreamStatusError { .. } | Self::StreamError(_) => "api_error",
            Self::InternalError(_) => "api_error",
        }
    }

    /// Classifies whether the dispatcher should retry this error.
    ///
    /// Mid-stream errors are never retried: the caller already received a
    /// prefix of the response by the time one can occur.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_) | Self::Overloaded(_) | Self::RateLimitExceeded { .. }
        ) || matches!(self, Self::UpstreamStatusError { status, .. } if matches!(status, 429 | 500 | 502 | 503 | 504))
    }

    /// Message safe to expose to API consumers.
    pub fn client_message(&self) -> String {
        match self {
            Self::InternalError(Some(provider_msg)) => provider_msg.clone(),
            Self::InternalError(None) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Error response format compatible with OpenAI-dialect upstreams.
#[derive(Debug, Serialize)]
struct OpenAiErrorResponse {
    error: OpenAiErrorDetails,
}

#[derive(Debug, Serialize)]
struct OpenAiErrorDetails {
    message: String,
    r#type: String,
    code: u16,
}

impl IntoResponse for LlmError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.client_message();

        let body = OpenAiErrorResponse {
            error: OpenAiErrorDetails {
                message,
                r#type: self.error_type().to_string(),
                code: status.as_u16(),
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<LlmError> for anthropic::ErrorResponse {
    fn from(error: LlmError) -> Self {
        Self {
            response_type: "error".to_string(),
            error: anthropic::AnthropicErrorDetails {
                error_type: error.error_type().to_string(),
                message: error.client_message(),
            },
        }
    }
}

/// Anthropic-dialect error response, returned by the `/v1/messages` surface.
pub struct AnthropicErrorResponse {
    status: StatusCode,
    body: anthropic::ErrorResponse,
}

impl From<LlmError> for AnthropicErrorResponse {
    fn from(error: LlmError) -> Self {
        let status = error.status_code();
        let body = anthropic::ErrorResponse::from(error);

        Self { status, body }
    }
}

impl IntoResponse for AnthropicErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub type AnthropicResult<T> = std::result::Result<T, AnthropicErrorResponse>;
