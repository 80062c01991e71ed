//! Request pipeline stages that run between authentication and the upstream
//! call.
//!
//! Stages communicate only through request extensions: the build stage
//! leaves an [`ActiveFilter`] (and the buffered body, if it read one) for the
//! apply stage to consume.

pub mod apply;
pub mod auth_extension;
pub mod build;
pub mod links;
pub mod options;

use axum::body::{Body, Bytes, to_bytes};
use axum::http::{HeaderMap, header};
use futures_util::{StreamExt, stream};
use serde_json::Value;

use crate::error::ProxyError;
use crate::filters::{FilterExpression, FilterShape, FilterTarget};

/// Validated filter for the current request
#[derive(Debug, Clone)]
pub struct ActiveFilter {
    pub expression: FilterExpression,
    pub target: FilterTarget,
    pub shape: FilterShape,
}

/// Request body already read by an earlier stage
#[derive(Debug, Clone)]
pub struct BufferedBody {
    pub bytes: Bytes,
    /// `None` when the body is empty or not JSON
    pub json: Option<Value>,
}

impl BufferedBody {
    pub fn new(bytes: Bytes) -> Self {
        let json = if bytes.is_empty() {
            None
        } else {
            serde_json::from_slice(&bytes).ok()
        };
        Self { bytes, json }
    }
}

/// Read a request body into memory, enforcing `limit`
pub async fn buffer_body(body: Body, limit: usize) -> Result<BufferedBody, ProxyError> {
    let bytes = to_bytes(body, limit)
        .await
        .map_err(|_| ProxyError::PayloadTooLarge)?;
    Ok(BufferedBody::new(bytes))
}

/// Whether a response declares a JSON media type
pub fn is_json_response(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            let media = ct.split(';').next().unwrap_or("").trim();
            media == "application/json" || media.ends_with("+json")
        })
        .unwrap_or(false)
}

/// Response body read up to a size cap
pub enum CappedBody {
    /// Entire body, no larger than the cap
    Complete(Bytes),
    /// Body exceeded the cap; it is returned intact, bytes read so far first
    Oversized(Body),
}

/// Declared `Content-Length`, when present and well formed
pub fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Read a response body into memory unless it turns out larger than `limit`
///
/// Oversized bodies are handed back unconsumed from the caller's point of
/// view, so a response-rewriting stage can pass them through untouched.
pub async fn read_capped(body: Body, limit: usize) -> Result<CappedBody, axum::Error> {
    let mut data = body.into_data_stream();
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = data.next().await {
        buf.extend_from_slice(&chunk?);
        if buf.len() > limit {
            let head = stream::once(async move { Ok::<_, axum::Error>(Bytes::from(buf)) });
            return Ok(CappedBody::Oversized(Body::from_stream(head.chain(data))));
        }
    }
    Ok(CappedBody::Complete(Bytes::from(buf)))
}
