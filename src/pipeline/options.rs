//! Capability-advertising `OPTIONS` responder
//!
//! Answers a plain `OPTIONS` request with the methods the caller could invoke
//! on the path, judged from the authorization table and the caller's token.
//! It sits outside the CORS layer, which would otherwise answer every
//! `OPTIONS` itself; true preflights are passed on to it.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::security::auth::{AuthClaims, extract_bearer_token};
use crate::security::enforce::{AuthPolicy, AuthState};

const ALLOWED_HEADERS: &str = "Authorization, Content-Type";
const MAX_AGE_SECS: &str = "86400";

fn is_preflight(headers: &HeaderMap) -> bool {
    headers.contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
}

/// `204` carrying `Allow` and the matching CORS headers
pub fn capability_response(
    policy: &AuthPolicy,
    path: &str,
    claims: Option<&AuthClaims>,
    origin: Option<&HeaderValue>,
) -> Response {
    let methods = policy
        .allowed_methods(path, claims)
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    debug!("OPTIONS {} -> [{}]", path, methods);

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&methods) {
        headers.insert(header::ALLOW, value.clone());
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
    headers.insert(
        HeaderName::from_static("access-control-max-age"),
        HeaderValue::from_static(MAX_AGE_SECS),
    );
    if let Some(origin) = origin {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    }

    (StatusCode::NO_CONTENT, headers).into_response()
}

/// Invalid or missing tokens are not an error here; the caller is simply
/// answered as anonymous.
pub async fn auth_options(State(state): State<AuthState>, request: Request, next: Next) -> Response {
    if request.method() != Method::OPTIONS || is_preflight(request.headers()) {
        return next.run(request).await;
    }

    let claims = match extract_bearer_token(request.headers()) {
        Some(token) => state
            .validator
            .validate(token)
            .await
            .inspect_err(|e| debug!("OPTIONS token ignored: {}", e))
            .ok(),
        None => None,
    };
    capability_response(
        &state.policy,
        request.uri().path(),
        claims.as_ref(),
        request.headers().get(header::ORIGIN),
    )
}
