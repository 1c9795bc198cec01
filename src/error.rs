//! Error types for speech-relay.
//!
//! `ProviderError` is what the remote adapters return. `RelayError` is what a
//! job reports at its boundary, and it knows how to render itself as the JSON
//! error body the HTTP surface sends back.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

/// Failure reported by a remote provider call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Rate limit reached: {message}")]
    RateLimited { message: String },

    #[error("Provider rejected the credential: {message}")]
    Auth { message: String },

    #[error("Provider quota exhausted: {message}")]
    Quota { message: String },

    #[error("Provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected provider response: {message}")]
    Transport { message: String },

    #[error("Provider returned an empty response")]
    EmptyResponse,
}

impl ProviderError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Failure of a whole conversion job.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("No text provided")]
    EmptyInput,

    #[error("No API credential configured or supplied")]
    MissingCredential,

    #[error("Invalid request body: {0}")]
    InvalidRequest(String),

    #[error("Summarization failed: {0}")]
    SummaryFailed(ProviderError),

    #[error("Failed to convert segment {} of {total}: {source}", .index + 1)]
    SegmentFailed {
        index: usize,
        total: usize,
        source: ProviderError,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// The provider failure underneath, if any.
    fn provider(&self) -> Option<&ProviderError> {
        match self {
            Self::SummaryFailed(e) => Some(e),
            Self::SegmentFailed { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Machine-readable tag the client keys its explanation on.
    pub fn type_tag(&self) -> &'static str {
        match self.provider() {
            Some(ProviderError::Auth { .. }) => return "provider_auth_error",
            Some(ProviderError::Quota { .. }) => return "provider_quota_error",
            Some(ProviderError::RateLimited { .. }) => return "rate_limited",
            Some(ProviderError::Transport { .. }) => return "internal_transport_error",
            _ => {}
        }
        match self {
            Self::EmptyInput => "empty_input",
            Self::MissingCredential => "missing_credential",
            Self::InvalidRequest(_) => "invalid_request",
            Self::SummaryFailed(_) => "summary_failed",
            Self::SegmentFailed { .. } => "segment_failed",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.provider() {
            Some(ProviderError::Auth { .. }) => return StatusCode::UNAUTHORIZED,
            Some(ProviderError::Quota { .. }) => return StatusCode::PAYMENT_REQUIRED,
            Some(ProviderError::RateLimited { .. }) => return StatusCode::TOO_MANY_REQUESTS,
            _ => {}
        }
        match self {
            Self::EmptyInput | Self::MissingCredential | Self::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON body: `{ error, type, code, ...details }`.
    pub fn to_json(&self) -> Value {
        let status = self.status_code();
        let mut body = json!({
            "error": self.to_string(),
            "type": self.type_tag(),
            "code": status.as_u16(),
        });
        if let Self::SegmentFailed { index, total, .. } = self {
            body["segment"] = json!(index);
            body["total"] = json!(total);
        }
        body
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_json())).into_response()
    }
}
