//! Filter build stage
//!
//! For requests matching the filter-endpoint table, assembles a
//! [`RequestContext`], asks the matching factory for an expression, validates
//! it and attaches it to the request as an [`ActiveFilter`]. Any failure
//! rejects the request; filtering is never silently skipped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, Method},
    middleware::Next,
    response::Response,
};
use indexmap::IndexMap;
use tracing::{debug, error};

use super::{ActiveFilter, buffer_body};
use crate::config::{ConfigError, FilterEndpoint, ProxyConfig};
use crate::error::ProxyError;
use crate::filters::{
    FilterFactory, FilterRegistry, FilterShape, FilterTarget, RequestContext, RequestInfo,
};
use crate::routes::{MethodRule, RouteTable};
use crate::security::auth::AuthClaims;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterRoute {
    pub target: FilterTarget,
    pub shape: FilterShape,
}

/// Filter-endpoint table and the factories it dispatches to
pub struct FilterState {
    table: RouteTable<FilterRoute>,
    items: Option<Arc<dyn FilterFactory>>,
    collections: Option<Arc<dyn FilterFactory>>,
    max_body_bytes: usize,
}

impl FilterState {
    pub fn new(
        table: RouteTable<FilterRoute>,
        items: Option<Arc<dyn FilterFactory>>,
        collections: Option<Arc<dyn FilterFactory>>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            table,
            items,
            collections,
            max_body_bytes,
        }
    }

    /// Build factories and the filter table; rows for unconfigured targets are left out
    pub fn from_config(
        config: &ProxyConfig,
        registry: &FilterRegistry,
    ) -> Result<Self, ConfigError> {
        let items = config
            .items_filter
            .as_ref()
            .map(|c| registry.build(c))
            .transpose()?;
        let collections = config
            .collections_filter
            .as_ref()
            .map(|c| registry.build(c))
            .transpose()?;

        let mut table = RouteTable::new(config.route_match_mode);
        let targets = [
            (FilterTarget::Items, items.is_some(), &config.items_filter_endpoints),
            (
                FilterTarget::Collections,
                collections.is_some(),
                &config.collections_filter_endpoints,
            ),
        ];
        for (target, enabled, endpoints) in targets {
            if enabled {
                push_endpoints(&mut table, target, endpoints)?;
            }
        }

        Ok(Self::new(table, items, collections, config.max_body_bytes))
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn factory(&self, target: FilterTarget) -> Option<&Arc<dyn FilterFactory>> {
        match target {
            FilterTarget::Items => self.items.as_ref(),
            FilterTarget::Collections => self.collections.as_ref(),
        }
    }
}

fn push_endpoints(
    table: &mut RouteTable<FilterRoute>,
    target: FilterTarget,
    endpoints: &[FilterEndpoint],
) -> Result<(), ConfigError> {
    for endpoint in endpoints {
        let methods = endpoint
            .methods
            .iter()
            .map(|m| MethodRule::new(m, Vec::new()))
            .collect::<Result<Vec<_>, _>>()?;
        table.push(
            &endpoint.pattern,
            methods,
            FilterRoute {
                target,
                shape: endpoint.shape,
            },
        )?;
    }
    Ok(())
}

/// `collection_id` / `item_id` from a STAC path, for patterns without named groups
fn stac_path_params(path: &str) -> HashMap<String, String> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let mut params = HashMap::new();
    if segments.first() == Some(&"collections") {
        if let Some(collection) = segments.get(1) {
            params.insert("collection_id".to_string(), collection.to_string());
        }
        if matches!(segments.get(2), Some(&"items") | Some(&"bulk_items"))
            && let Some(item) = segments.get(3)
        {
            params.insert("item_id".to_string(), item.to_string());
        }
    }
    params
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
    }
    map
}

pub(crate) fn query_map(query: Option<&str>) -> IndexMap<String, String> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Generate, validate and attach the filter for matching requests
pub async fn build_filter(
    State(state): State<Arc<FilterState>>,
    request: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    let path = request.uri().path().to_string();
    let method = request.method().clone();

    let Some(found) = state.table.find(&path, &method) else {
        return Ok(next.run(request).await);
    };
    let route = *found.meta;
    let Some(factory) = state.factory(route.target) else {
        return Ok(next.run(request).await);
    };

    let mut path_params = stac_path_params(&path);
    path_params.extend(found.params);

    let (mut parts, body) = request.into_parts();
    let (buffered, body) = if carries_body(&method) {
        (Some(buffer_body(body, state.max_body_bytes).await?), None)
    } else {
        (None, Some(body))
    };

    let ctx = RequestContext {
        req: RequestInfo {
            path: path.clone(),
            method: method.to_string(),
            query_params: query_map(parts.uri.query()),
            path_params,
            headers: header_map(&parts.headers),
            body: buffered.as_ref().and_then(|b| b.json.clone()),
        },
        payload: parts
            .extensions
            .get::<AuthClaims>()
            .map(|claims| claims.claims.clone()),
    };

    let expression = factory.generate(&ctx).await.inspect_err(|e| {
        error!("Filter generation failed for {} {}: {}", method, path, e);
    })?;
    expression.validate().map_err(|e| {
        error!("Generated filter for {} {} is invalid: {}", method, path, e);
        ProxyError::FilterGenerationFailed(e.to_string())
    })?;
    debug!("Filter for {} {}: {}", method, path, expression);

    parts.extensions.insert(ActiveFilter {
        expression,
        target: route.target,
        shape: route.shape,
    });

    let body = match (buffered, body) {
        (Some(buffered), _) => {
            let body = Body::from(buffered.bytes.clone());
            parts.extensions.insert(buffered);
            body
        }
        (None, Some(body)) => body,
        (None, None) => Body::empty(),
    };

    Ok(next.run(Request::from_parts(parts, body)).await)
}
