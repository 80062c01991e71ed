//! STAC authentication extension
//!
//! Catalog, collection and item responses are annotated so clients can tell
//! which links need a token before following them: the document lists the
//! extension schema in `stac_extensions`, defines an OpenID Connect scheme
//! under `auth:schemes`, and every link whose target the authorization table
//! protects gets `auth:refs` naming that scheme.

use std::sync::{Arc, LazyLock};

use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::{IntoResponse, Response},
};
use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};
use url::Url;

use super::{CappedBody, declared_length, is_json_response, read_capped};
use crate::error::ProxyError;
use crate::proxy::rebuild_response;
use crate::security::enforce::AuthPolicy;

pub const EXTENSION_SCHEMA: &str =
    "https://stac-extensions.github.io/authentication/v1.1.0/schema.json";

static STAC_DOCUMENT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^/(collections(/[^/]+(/items(/[^/]+)?)?)?|search)?$").ok()
});

/// Whether `path` serves a STAC catalog, collection, item or item list
pub fn is_stac_document(path: &str) -> bool {
    STAC_DOCUMENT
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(path))
}

pub struct AuthExtension {
    scheme_name: String,
    scheme: Value,
    policy: Arc<AuthPolicy>,
    /// Path of the upstream base URL, stripped from absolute link targets
    upstream_prefix: String,
    max_body_bytes: usize,
}

impl AuthExtension {
    pub fn new(
        discovery_url: &str,
        scheme_name: &str,
        policy: Arc<AuthPolicy>,
        upstream: &Url,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            scheme_name: scheme_name.to_string(),
            scheme: json!({
                "type": "openIdConnect",
                "description": "requires a login and user token",
                "openIdConnectUrl": discovery_url,
            }),
            policy,
            upstream_prefix: upstream.path().trim_end_matches('/').to_string(),
            max_body_bytes,
        }
    }

    /// Route path a link points at, relative to the upstream root
    fn link_path(&self, href: &str) -> Option<String> {
        let url = match Url::parse(href) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Url::parse("http://localhost/").ok()?.join(href).ok()?
            }
            Err(_) => return None,
        };
        let path = url.path();
        if self.upstream_prefix.is_empty() {
            return Some(path.to_string());
        }
        match path.strip_prefix(self.upstream_prefix.as_str()) {
            Some("") => Some("/".to_string()),
            Some(rest) if rest.starts_with('/') => Some(rest.to_string()),
            _ => Some(path.to_string()),
        }
    }

    /// Tag protected links in `links`; returns how many were tagged
    fn tag_links(&self, links: Option<&mut Value>) -> usize {
        let Some(Value::Array(links)) = links else {
            return 0;
        };
        let mut tagged = 0;
        for link in links.iter_mut() {
            let Some(href) = link.get("href").and_then(Value::as_str) else {
                continue;
            };
            let Some(path) = self.link_path(href) else {
                continue;
            };
            let method = link
                .get("method")
                .and_then(Value::as_str)
                .and_then(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok())
                .unwrap_or(Method::GET);
            if !self.policy.decide(&path, &method).is_private() {
                continue;
            }

            let Some(link) = link.as_object_mut() else {
                continue;
            };
            let refs = link
                .entry("auth:refs")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(refs) = refs
                && !refs.iter().any(|r| r.as_str() == Some(self.scheme_name.as_str()))
            {
                refs.push(Value::String(self.scheme_name.clone()));
                tagged += 1;
            }
        }
        tagged
    }

    /// Declare the extension and scheme on a STAC object
    ///
    /// Items carry `auth:schemes` in their properties, other objects at the
    /// top level.
    fn declare(&self, object: &mut Map<String, Value>) {
        let extensions = object
            .entry("stac_extensions")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(extensions) = extensions
            && !extensions.iter().any(|e| e.as_str() == Some(EXTENSION_SCHEMA))
        {
            extensions.push(Value::String(EXTENSION_SCHEMA.to_string()));
        }

        let is_item = object.get("type").and_then(Value::as_str) == Some("Feature");
        let holder = if is_item {
            match object
                .entry("properties")
                .or_insert_with(|| Value::Object(Map::new()))
            {
                Value::Object(properties) => properties,
                _ => return,
            }
        } else {
            object
        };
        let schemes = holder
            .entry("auth:schemes")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(schemes) = schemes {
            schemes.insert(self.scheme_name.clone(), self.scheme.clone());
        }
    }

    /// Annotate a STAC document; returns whether it changed
    ///
    /// The top-level object is always declared. Objects nested under
    /// `features` or `collections` are declared only when one of their own
    /// links was tagged.
    pub fn annotate(&self, doc: &mut Value) -> bool {
        let Some(root) = doc.as_object_mut() else {
            return false;
        };
        self.tag_links(root.get_mut("links"));
        for nested in ["features", "collections"] {
            let Some(Value::Array(children)) = root.get_mut(nested) else {
                continue;
            };
            for child in children.iter_mut() {
                if self.tag_links(child.get_mut("links")) > 0
                    && let Some(child) = child.as_object_mut()
                {
                    self.declare(child);
                }
            }
        }
        self.declare(root);
        true
    }
}

/// Add authentication extension fields to STAC responses
pub async fn add_auth_extension(
    State(extension): State<Arc<AuthExtension>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::GET || !is_stac_document(request.uri().path()) {
        return next.run(request).await;
    }

    let response = next.run(request).await;
    if !response.status().is_success() || !is_json_response(response.headers()) {
        return response;
    }
    if declared_length(response.headers()).is_some_and(|len| len > extension.max_body_bytes as u64) {
        debug!("Response too large for the authentication extension; passing through");
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match read_capped(body, extension.max_body_bytes).await {
        Ok(CappedBody::Complete(bytes)) => bytes,
        Ok(CappedBody::Oversized(body)) => {
            debug!("Response too large for the authentication extension; passing through");
            return Response::from_parts(parts, body);
        }
        Err(e) => {
            warn!("Upstream response failed while reading for the authentication extension: {}", e);
            return ProxyError::UpstreamUnavailable(e.to_string()).into_response();
        }
    };

    let Ok(mut doc) = serde_json::from_slice::<Value>(&bytes) else {
        return rebuild_response(parts, bytes);
    };
    if !extension.annotate(&mut doc) {
        return rebuild_response(parts, bytes);
    }
    match serde_json::to_vec(&doc) {
        Ok(body) => rebuild_response(parts, body.into()),
        Err(_) => rebuild_response(parts, bytes),
    }
}
