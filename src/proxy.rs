//! Upstream STAC API client
//!
//! Forwards requests to the upstream API and turns its responses back into
//! axum responses. Hop-by-hop headers are stripped in both directions and the
//! usual `X-Forwarded-*` headers are added. Response bodies are streamed
//! through unless a later stage needs to read them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes, to_bytes},
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::Response,
};
use futures_util::TryStreamExt;
use serde_json::Value;
use tracing::{debug, error};
use url::Url;

use crate::config::ConfigError;
use crate::error::ProxyError;

const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
];

/// Copy `src` minus hop-by-hop headers, optionally dropping `content-length`
pub fn forwardable_headers(src: &HeaderMap, keep_length: bool) -> HeaderMap {
    let mut headers = src.clone();
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    if !keep_length {
        headers.remove(header::CONTENT_LENGTH);
    }
    headers
}

/// HTTP client bound to the upstream API's base URL
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    base: Url,
    http: reqwest::Client,
    max_body_bytes: usize,
}

impl UpstreamClient {
    pub fn new(base_url: &str, timeout: Duration, max_body_bytes: usize) -> Result<Self, ConfigError> {
        let base = Url::parse(base_url)
            .map_err(|e| ConfigError::Invalid(format!("upstream_url: {}", e)))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ConfigError::Invalid(format!("upstream client: {}", e)))?;
        Ok(Self {
            base,
            http,
            max_body_bytes,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Upstream URL for a request's path and query
    pub fn url_for(&self, path_and_query: &str) -> String {
        format!(
            "{}{}",
            self.base.as_str().trim_end_matches('/'),
            path_and_query
        )
    }

    /// Forward a request to the upstream API
    pub async fn forward(&self, request: Request) -> Result<reqwest::Response, ProxyError> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let url = self.url_for(path_and_query);

        let mut headers = forwardable_headers(&parts.headers, false);
        // Bodies may need inspection on the way back; ask for them uncompressed.
        headers.remove(header::ACCEPT_ENCODING);
        add_forwarding_headers(&mut headers, &parts.headers, parts.extensions.get());

        let body = to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|_| ProxyError::PayloadTooLarge)?;

        debug!("Forwarding {} {}", parts.method, url);
        let response = self
            .http
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .inspect_err(|e| error!("Upstream request to {} failed: {}", url, e))?;
        Ok(response)
    }

    /// GET a JSON document from the upstream API; `Ok(None)` when it does not exist
    pub async fn fetch_json(
        &self,
        path: &str,
        client_headers: &HeaderMap,
    ) -> Result<Option<Value>, ProxyError> {
        let url = self.url_for(path);
        let mut headers = HeaderMap::new();
        if let Some(auth) = client_headers.get(header::AUTHORIZATION) {
            headers.insert(header::AUTHORIZATION, auth.clone());
        }
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        debug!("Fetching existing record from {}", url);
        let response = self.http.get(&url).headers(headers).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let record = response.json::<Value>().await.map_err(|e| {
                    ProxyError::UpstreamUnavailable(format!("record at {} is not JSON: {}", url, e))
                })?;
                Ok(Some(record))
            }
            status => Err(ProxyError::UpstreamUnavailable(format!(
                "fetching {} returned {}",
                url, status
            ))),
        }
    }
}

/// Set `X-Forwarded-For`, `-Host` and `-Proto` unless an outer proxy already did
fn add_forwarding_headers(
    headers: &mut HeaderMap,
    original: &HeaderMap,
    peer: Option<&ConnectInfo<SocketAddr>>,
) {
    let forwarded_for = HeaderName::from_static("x-forwarded-for");
    if let Some(ConnectInfo(addr)) = peer {
        let ip = addr.ip().to_string();
        let value = match original.get(&forwarded_for).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{}, {}", existing, ip),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(forwarded_for, value);
        }
    }

    let forwarded_host = HeaderName::from_static("x-forwarded-host");
    if !headers.contains_key(&forwarded_host)
        && let Some(host) = original.get(header::HOST)
    {
        headers.insert(forwarded_host, host.clone());
    }

    let forwarded_proto = HeaderName::from_static("x-forwarded-proto");
    if !headers.contains_key(&forwarded_proto) {
        headers.insert(forwarded_proto, HeaderValue::from_static("http"));
    }
}

/// Stream an upstream response back to the client unchanged
pub fn stream_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = forwardable_headers(upstream.headers(), true);
    let stream = upstream
        .bytes_stream()
        .inspect_err(|e| error!("Upstream response stream failed: {}", e));

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Response with `body` replacing whatever `parts` described
pub fn rebuild_response(parts: axum::http::response::Parts, body: Bytes) -> Response {
    let mut parts = parts;
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(body))
}

/// Fallback handler: forward anything that reached the end of the pipeline
pub async fn proxy_handler(
    State(upstream): State<Arc<UpstreamClient>>,
    request: Request,
) -> Result<Response, ProxyError> {
    if request.method() == Method::CONNECT {
        return Err(ProxyError::BadRequest("CONNECT is not supported".into()));
    }
    let response = upstream.forward(request).await?;
    Ok(stream_response(response))
}
