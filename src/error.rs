//! Error taxonomy for the HTTP surface.
//!
//! Domain errors map to status codes and a JSON `{error, code}` body.
//! Cache failures never surface here on read paths (callers fall through to
//! the durable store); vendor push failures never fail the originating
//! request.

use crate::models::ErrorResponse;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Domain error surfaced to API clients.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(&'static str),

    /// Message consumed or expired.
    #[error("{0}")]
    Gone(&'static str),

    /// Link already consumed, conversation inactive for a write, and similar.
    #[error("{0}")]
    Conflict(&'static str),

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("payload exceeds tier size limit")]
    PayloadTooLarge,

    /// Malformed request body or header.
    #[error("{0}")]
    Validation(&'static str),

    /// Cache or vendor push unavailable where no degraded path exists.
    #[error("{0}")]
    ServiceUnavailable(&'static str),

    #[error("internal server error")]
    Internal,
}

impl ApiError {
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Gone(_) => StatusCode::GONE,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Gone(_) => "GONE",
            Self::Conflict(_) => "CONFLICT",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::Validation(_) => "INVALID_INPUT",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code(),
        });
        (self.status(), body).into_response()
    }
}
