//! Filter apply stage
//!
//! Consumes the [`ActiveFilter`] left by the build stage. Reads of many
//! records get the filter pushed upstream (query string for `GET`, body for
//! `POST`); single-record reads and writes are checked locally against the
//! expression, since the upstream cannot filter those endpoints.

use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, Method, Uri, request::Parts},
    middleware::Next,
    response::Response,
};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{ActiveFilter, BufferedBody, buffer_body, is_json_response};
use crate::error::ProxyError;
use crate::filters::{FilterExpression, FilterShape};
use crate::proxy::{UpstreamClient, rebuild_response};

const FILTER_PARAM: &str = "filter";
const FILTER_LANG_PARAM: &str = "filter-lang";
const CQL2_TEXT: &str = "cql2-text";
const CQL2_JSON: &str = "cql2-json";

#[derive(Debug, Clone)]
pub struct ApplyState {
    pub upstream: Arc<UpstreamClient>,
    pub max_body_bytes: usize,
}

fn parse_client_filter(raw: &Value) -> Result<FilterExpression, ProxyError> {
    FilterExpression::from_value(raw)
        .map_err(|e| ProxyError::BadRequest(format!("client filter: {}", e)))
}

fn check_lang(lang: &str) -> Result<(), ProxyError> {
    if lang == CQL2_TEXT || lang == CQL2_JSON {
        Ok(())
    } else {
        Err(ProxyError::BadRequest(format!("unsupported filter-lang {}", lang)))
    }
}

fn combine(
    filter: &FilterExpression,
    existing: Option<FilterExpression>,
) -> Result<FilterExpression, ProxyError> {
    match existing {
        Some(client) => filter
            .and(&client)
            .map_err(|e| ProxyError::FilterGenerationFailed(e.to_string())),
        None => Ok(filter.clone()),
    }
}

/// AND `filter` into a query string's `filter` parameter
///
/// The client's `filter-lang` is kept (default `cql2-text`); the output has
/// exactly one `filter` and one `filter-lang` parameter.
pub fn merge_query(query: Option<&str>, filter: &FilterExpression) -> Result<String, ProxyError> {
    let pairs: Vec<(String, String)> = query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let lang = pairs
        .iter()
        .find(|(k, _)| k == FILTER_LANG_PARAM)
        .map_or(CQL2_TEXT, |(_, v)| v.as_str())
        .to_string();
    check_lang(&lang)?;

    let existing = pairs
        .iter()
        .find(|(k, v)| k == FILTER_PARAM && !v.trim().is_empty())
        .map(|(_, v)| parse_client_filter(&Value::String(v.clone())))
        .transpose()?;
    let combined = combine(filter, existing)?;

    let serialized = if lang == CQL2_JSON {
        combined.to_value().map(|v| v.to_string())
    } else {
        combined.to_text()
    }
    .map_err(|e| ProxyError::FilterGenerationFailed(e.to_string()))?;

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    serializer.extend_pairs(
        pairs
            .iter()
            .filter(|(k, _)| k != FILTER_PARAM && k != FILTER_LANG_PARAM),
    );
    serializer.append_pair(FILTER_PARAM, &serialized);
    serializer.append_pair(FILTER_LANG_PARAM, &lang);
    Ok(serializer.finish())
}

/// AND `filter` into a search body's `filter` field
///
/// `filter-lang` defaults to `cql2-json` for bodies.
pub fn merge_body(body: Value, filter: &FilterExpression) -> Result<Value, ProxyError> {
    let Value::Object(mut body) = body else {
        return Err(ProxyError::BadRequest("search body must be a JSON object".into()));
    };

    let lang = match body.get(FILTER_LANG_PARAM) {
        Some(Value::String(lang)) => lang.clone(),
        Some(_) => return Err(ProxyError::BadRequest("filter-lang must be a string".into())),
        None => CQL2_JSON.to_string(),
    };
    check_lang(&lang)?;

    let existing = match body.get(FILTER_PARAM) {
        None | Some(Value::Null) => None,
        Some(raw) => Some(parse_client_filter(raw)?),
    };
    let combined = combine(filter, existing)?;

    let serialized = if lang == CQL2_TEXT {
        combined.to_text().map(Value::String)
    } else {
        combined.to_value()
    }
    .map_err(|e| ProxyError::FilterGenerationFailed(e.to_string()))?;

    body.insert(FILTER_PARAM.to_string(), serialized);
    body.insert(FILTER_LANG_PARAM.to_string(), Value::String(lang));
    Ok(Value::Object(body))
}

/// JSON merge patch: objects merge recursively, `null` removes, anything else replaces
pub fn deep_merge(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            let mut merged: Map<String, Value> = base.clone();
            for (key, value) in patch {
                if value.is_null() {
                    merged.remove(key);
                } else {
                    let next = match merged.get(key) {
                        Some(existing) => deep_merge(existing, value),
                        None => value.clone(),
                    };
                    merged.insert(key.clone(), next);
                }
            }
            Value::Object(merged)
        }
        (_, patch) => patch.clone(),
    }
}

async fn take_body(
    parts: &mut Parts,
    body: Body,
    limit: usize,
) -> Result<BufferedBody, ProxyError> {
    match parts.extensions.remove::<BufferedBody>() {
        Some(buffered) => Ok(buffered),
        None => buffer_body(body, limit).await,
    }
}

/// Write body as a JSON object; an empty body counts as `{}`
fn object_body(buffered: &BufferedBody) -> Result<Value, ProxyError> {
    match &buffered.json {
        Some(value @ Value::Object(_)) => Ok(value.clone()),
        None if buffered.bytes.is_empty() => Ok(Value::Object(Map::new())),
        _ => Err(ProxyError::BadRequest("request body must be a JSON object".into())),
    }
}

fn with_query(uri: &Uri, query: &str) -> Result<Uri, ProxyError> {
    format!("{}?{}", uri.path(), query)
        .parse()
        .map_err(|e| ProxyError::BadRequest(format!("rewritten query: {}", e)))
}

fn replace_body(parts: Parts, value: &Value) -> Result<Request, ProxyError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| ProxyError::BadRequest(format!("request body: {}", e)))?;
    Ok(Request::from_parts(parts, Body::from(bytes)))
}

/// Fetch the record a write targets and check the caller may touch it
async fn authorize_existing(
    upstream: &UpstreamClient,
    path: &str,
    headers: &HeaderMap,
    filter: &FilterExpression,
) -> Result<Value, ProxyError> {
    let Some(existing) = upstream.fetch_json(path, headers).await? else {
        return Err(ProxyError::NotFound);
    };
    if !filter.matches(&existing) {
        warn!("Existing record at {} is outside the caller's filter", path);
        return Err(ProxyError::Forbidden("record does not match access filter".into()));
    }
    Ok(existing)
}

/// Validate a single-record response; hidden records become `NotFound`
async fn filter_record_response(
    response: Response,
    filter: &FilterExpression,
    limit: usize,
) -> Result<Response, ProxyError> {
    let (parts, body) = response.into_parts();
    let bytes = to_bytes(body, limit)
        .await
        .map_err(|e| ProxyError::UpstreamUnavailable(format!("reading record: {}", e)))?;

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(record) if record.is_object() => {
            if filter.matches(&record) {
                Ok(rebuild_response(parts, bytes))
            } else {
                debug!("Hiding record that does not match the caller's filter");
                Err(ProxyError::NotFound)
            }
        }
        _ if parts.status.is_success() || is_json_response(&parts.headers) => {
            debug!("Record response could not be checked against the filter");
            Err(ProxyError::NotFound)
        }
        _ => Ok(rebuild_response(parts, bytes)),
    }
}

/// Push the active filter upstream or enforce it locally
pub async fn apply_filter(
    State(state): State<ApplyState>,
    request: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    let Some(active) = request.extensions().get::<ActiveFilter>().cloned() else {
        return Ok(next.run(request).await);
    };
    let filter = &active.expression;
    let method = request.method().clone();

    match (active.shape, method) {
        (FilterShape::Search | FilterShape::List, Method::GET) => {
            let (mut parts, body) = request.into_parts();
            let query = merge_query(parts.uri.query(), filter)?;
            debug!("Applying filter to query of {}", parts.uri.path());
            parts.uri = with_query(&parts.uri, &query)?;
            Ok(next.run(Request::from_parts(parts, body)).await)
        }
        (FilterShape::Search, Method::POST) => {
            let (mut parts, body) = request.into_parts();
            let buffered = take_body(&mut parts, body, state.max_body_bytes).await?;
            let Some(json) = buffered.json else {
                return Err(ProxyError::BadRequest("search body must be JSON".into()));
            };
            let merged = merge_body(json, filter)?;
            Ok(next.run(replace_body(parts, &merged)?).await)
        }
        (FilterShape::List, Method::POST) => {
            let (mut parts, body) = request.into_parts();
            let buffered = take_body(&mut parts, body, state.max_body_bytes).await?;
            let record = match &buffered.json {
                Some(value @ Value::Object(_)) => value,
                _ => return Err(ProxyError::BadRequest("created record must be a JSON object".into())),
            };
            if !filter.matches(record) {
                warn!("Rejecting create on {}: record outside filter", parts.uri.path());
                return Err(ProxyError::FilterValidationFailed(
                    "created record does not match access filter".into(),
                ));
            }
            Ok(next
                .run(Request::from_parts(parts, Body::from(buffered.bytes)))
                .await)
        }
        (FilterShape::Record, Method::GET) => {
            let response = next.run(request).await;
            filter_record_response(response, filter, state.max_body_bytes).await
        }
        (FilterShape::Record, method @ (Method::PUT | Method::PATCH)) => {
            let (mut parts, body) = request.into_parts();
            let buffered = take_body(&mut parts, body, state.max_body_bytes).await?;
            let update = object_body(&buffered)?;

            let path = parts.uri.path().to_string();
            let existing =
                authorize_existing(&state.upstream, &path, &parts.headers, filter).await?;
            let prospective = if method == Method::PATCH {
                deep_merge(&existing, &update)
            } else {
                update
            };
            if !filter.matches(&prospective) {
                warn!("Rejecting {} on {}: result outside filter", method, path);
                return Err(ProxyError::Forbidden(
                    "updated record does not match access filter".into(),
                ));
            }
            Ok(next
                .run(Request::from_parts(parts, Body::from(buffered.bytes)))
                .await)
        }
        (FilterShape::Record, Method::DELETE) => {
            let path = request.uri().path().to_string();
            authorize_existing(&state.upstream, &path, request.headers(), filter).await?;
            Ok(next.run(request).await)
        }
        (shape, method) => {
            debug!("No filter application for {:?} {}", shape, method);
            Ok(next.run(request).await)
        }
    }
}
