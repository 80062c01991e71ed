//! Request-level error taxonomy and its HTTP rendering
//!
//! Every stage of the pipeline reports failures as a [`ProxyError`]. The
//! response body is always the minimal `{"code", "description"}` document; the
//! internal cause is logged but never echoed to the client.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::filters::FilterError;
use crate::security::auth::TokenError;

/// Failure that terminates a single request
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Missing or invalid bearer token on a route that requires one
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Insufficient scope, or a write on a record outside the caller's filter
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Record does not exist or is hidden by the caller's filter
    #[error("not found")]
    NotFound,

    /// Client payload is not acceptable under the caller's filter
    #[error("filter validation failed: {0}")]
    FilterValidationFailed(String),

    /// Client payload could not be parsed
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Body exceeds the buffering limit
    #[error("payload too large")]
    PayloadTooLarge,

    /// Filter factory produced nothing usable
    #[error("filter generation failed: {0}")]
    FilterGenerationFailed(String),

    /// Signing keys could not be discovered or fetched
    #[error("key discovery failed: {0}")]
    KeyDiscoveryFailed(String),

    /// Upstream API unreachable or returned an unusable response
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream API did not answer in time
    #[error("upstream timed out")]
    UpstreamTimeout,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    description: &'static str,
}

impl ProxyError {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::FilterValidationFailed(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::FilterGenerationFailed(_) | Self::UpstreamUnavailable(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::KeyDiscoveryFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Stable error code and client-safe description
    fn details(&self) -> (&'static str, &'static str) {
        match self {
            Self::Unauthorized(_) => ("Unauthorized", "A valid bearer token is required."),
            Self::Forbidden(_) => ("Forbidden", "Insufficient permissions for this request."),
            Self::NotFound => ("NotFound", "Not found."),
            Self::FilterValidationFailed(_) => (
                "FilterValidationFailed",
                "Request body does not satisfy the access filter.",
            ),
            Self::BadRequest(_) => ("ParseError", "Request could not be parsed."),
            Self::PayloadTooLarge => ("PayloadTooLarge", "Request body is too large."),
            Self::FilterGenerationFailed(_) => (
                "FilterGenerationFailed",
                "Unable to determine an access filter for this request.",
            ),
            Self::KeyDiscoveryFailed(_) => (
                "KeyDiscoveryFailed",
                "Token signing keys are temporarily unavailable.",
            ),
            Self::UpstreamUnavailable(_) => ("UpstreamError", "Upstream service unavailable."),
            Self::UpstreamTimeout => ("UpstreamTimeout", "Upstream service timed out."),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed with {}: {}", status, self);
        } else {
            debug!("Request rejected with {}: {}", status, self);
        }

        let (code, description) = self.details();
        let mut response = (status, Json(ErrorBody { code, description })).into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer"),
            );
        }

        response
    }
}

impl From<TokenError> for ProxyError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::KeyDiscoveryFailed(msg) => Self::KeyDiscoveryFailed(msg),
            other => Self::Unauthorized(other.to_string()),
        }
    }
}

impl From<FilterError> for ProxyError {
    fn from(err: FilterError) -> Self {
        Self::FilterGenerationFailed(err.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::UpstreamTimeout
        } else {
            Self::UpstreamUnavailable(err.to_string())
        }
    }
}
