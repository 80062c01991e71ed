//! Rewrites `links[].href` in JSON responses so that links the upstream
//! generated for itself point back through the proxy.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::{CappedBody, declared_length, is_json_response, read_capped};
use crate::error::ProxyError;
use crate::proxy::rebuild_response;

#[derive(Debug, Clone)]
pub struct LinkRewriter {
    upstream: Url,
    root_path: String,
    max_body_bytes: usize,
}

fn authority(url: &Url) -> (Option<&str>, Option<u16>) {
    (url.host_str(), url.port_or_known_default())
}

/// Externally visible base URL of the proxy for this request
pub fn request_base(headers: &HeaderMap) -> Option<Url> {
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let proto = header_str("x-forwarded-proto")
        .map(|p| p.split(',').next().unwrap_or(p).trim())
        .unwrap_or("http");
    let host = header_str("x-forwarded-host")
        .or_else(|| header_str(header::HOST.as_str()))?
        .split(',')
        .next()?
        .trim();
    Url::parse(&format!("{}://{}", proto, host)).ok()
}

impl LinkRewriter {
    pub fn new(upstream: Url, root_path: &str, max_body_bytes: usize) -> Self {
        Self {
            upstream,
            root_path: root_path.trim_end_matches('/').to_string(),
            max_body_bytes,
        }
    }

    fn upstream_prefix(&self) -> &str {
        self.upstream.path().trim_end_matches('/')
    }

    /// New href for `href`, or `None` when it should be left alone
    fn rewrite_href(&self, href: &str, base: &Url) -> Option<String> {
        let link = Url::parse(href).ok()?;
        let on_upstream = authority(&link) == authority(&self.upstream);
        if !on_upstream && authority(&link) != authority(base) {
            return None;
        }

        let prefix = self.upstream_prefix();
        let path = link.path();
        if !on_upstream && !self.root_path.is_empty() && path.starts_with(&self.root_path) {
            return None;
        }
        let stripped = if prefix.is_empty() {
            path
        } else if path == prefix || path.starts_with(&format!("{}/", prefix)) {
            &path[prefix.len()..]
        } else {
            return None;
        };

        let origin = if on_upstream { base } else { &link };
        let mut rewritten = format!(
            "{}{}{}",
            origin.origin().ascii_serialization(),
            self.root_path,
            stripped
        );
        if let Some(query) = link.query() {
            rewritten.push('?');
            rewritten.push_str(query);
        }
        if let Some(fragment) = link.fragment() {
            rewritten.push('#');
            rewritten.push_str(fragment);
        }
        (rewritten != href).then_some(rewritten)
    }

    fn rewrite_link_array(&self, links: Option<&mut Value>, base: &Url) -> bool {
        let Some(Value::Array(links)) = links else {
            return false;
        };
        let mut changed = false;
        for link in links {
            let Some(href) = link.get("href").and_then(Value::as_str) else {
                continue;
            };
            if let Some(rewritten) = self.rewrite_href(href, base) {
                debug!("Rewriting link {} -> {}", href, rewritten);
                link["href"] = Value::String(rewritten);
                changed = true;
            }
        }
        changed
    }

    /// Rewrite links in a STAC document; returns whether anything changed
    pub fn rewrite(&self, doc: &mut Value, base: &Url) -> bool {
        let mut changed = self.rewrite_link_array(doc.get_mut("links"), base);
        for nested in ["features", "collections"] {
            if let Some(Value::Array(children)) = doc.get_mut(nested) {
                for child in children {
                    changed |= self.rewrite_link_array(child.get_mut("links"), base);
                }
            }
        }
        changed
    }
}

pub async fn rewrite_links(
    State(rewriter): State<Arc<LinkRewriter>>,
    request: Request,
    next: Next,
) -> Response {
    let base = request_base(request.headers());
    let response = next.run(request).await;

    let Some(base) = base else {
        return response;
    };
    if !is_json_response(response.headers()) {
        return response;
    }
    if declared_length(response.headers()).is_some_and(|len| len > rewriter.max_body_bytes as u64) {
        debug!("Response too large for link rewriting; passing through");
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match read_capped(body, rewriter.max_body_bytes).await {
        Ok(CappedBody::Complete(bytes)) => bytes,
        Ok(CappedBody::Oversized(body)) => {
            debug!("Response too large for link rewriting; passing through");
            return Response::from_parts(parts, body);
        }
        Err(e) => {
            warn!("Upstream response failed while reading for link rewriting: {}", e);
            return ProxyError::UpstreamUnavailable(e.to_string()).into_response();
        }
    };

    let Ok(mut doc) = serde_json::from_slice::<Value>(&bytes) else {
        return rebuild_response(parts, bytes);
    };
    if !rewriter.rewrite(&mut doc, &base) {
        return rebuild_response(parts, bytes);
    }
    match serde_json::to_vec(&doc) {
        Ok(body) => rebuild_response(parts, body.into()),
        Err(_) => rebuild_response(parts, bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Url {
        Url::parse("https://stac.example.com").unwrap()
    }

    #[test]
    fn test_request_base_prefers_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "internal:8000".parse().unwrap());
        assert_eq!(request_base(&headers).unwrap().as_str(), "http://internal:8000/");

        headers.insert("x-forwarded-host", "stac.example.com".parse().unwrap());
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        assert_eq!(request_base(&headers).unwrap(), base());

        assert!(request_base(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_rewrites_upstream_links_and_strips_upstream_path() {
        let rewriter = LinkRewriter::new(
            Url::parse("http://upstream:8080/api/v1").unwrap(),
            "",
            1024,
        );
        let mut doc = json!({
            "links": [
                {"rel": "self", "href": "http://upstream:8080/api/v1/collections?limit=2"},
                {"rel": "license", "href": "https://creativecommons.org/licenses/by/4.0/"},
            ],
            "collections": [
                {"id": "a", "links": [{"rel": "self", "href": "http://upstream:8080/api/v1/collections/a"}]}
            ]
        });

        assert!(rewriter.rewrite(&mut doc, &base()));
        assert_eq!(doc["links"][0]["href"], "https://stac.example.com/collections?limit=2");
        assert_eq!(doc["links"][1]["href"], "https://creativecommons.org/licenses/by/4.0/");
        assert_eq!(
            doc["collections"][0]["links"][0]["href"],
            "https://stac.example.com/collections/a"
        );
    }

    #[test]
    fn test_root_path_is_prepended() {
        let rewriter = LinkRewriter::new(Url::parse("http://upstream:8080").unwrap(), "/stac/", 1024);
        let mut doc = json!({
            "features": [{"links": [{"href": "http://upstream:8080/collections/a/items/1"}]}]
        });

        assert!(rewriter.rewrite(&mut doc, &base()));
        assert_eq!(
            doc["features"][0]["links"][0]["href"],
            "https://stac.example.com/stac/collections/a/items/1"
        );
    }

    #[test]
    fn test_unrelated_documents_are_unchanged() {
        let rewriter = LinkRewriter::new(Url::parse("http://upstream:8080").unwrap(), "", 1024);
        let mut doc = json!({"links": [{"href": "https://stac.example.com/collections"}], "id": 1});
        assert!(!rewriter.rewrite(&mut doc, &base()));
        assert!(!rewriter.rewrite(&mut json!({"type": "Feature"}), &base()));
    }
}
