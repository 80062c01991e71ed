//! OpenAPI document augmentation
//!
//! The upstream API serves its own OpenAPI document, which knows nothing
//! about the proxy's authentication. Requests for that document are
//! intercepted and the response annotated with an OpenID Connect security
//! scheme, plus a security requirement on every operation the authorization
//! table protects.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::pipeline::{CappedBody, declared_length, is_json_response, read_capped};
use crate::proxy::rebuild_response;
use crate::security::enforce::{AuthPolicy, Requirement};

const OPERATION_KEYS: [&str; 8] = [
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

pub struct OpenApiAugmenter {
    document_path: String,
    discovery_url: String,
    scheme_name: String,
    policy: Arc<AuthPolicy>,
    max_body_bytes: usize,
}

impl OpenApiAugmenter {
    pub fn new(
        document_path: &str,
        discovery_url: &str,
        scheme_name: &str,
        policy: Arc<AuthPolicy>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            document_path: document_path.to_string(),
            discovery_url: discovery_url.to_string(),
            scheme_name: scheme_name.to_string(),
            policy,
            max_body_bytes,
        }
    }

    pub fn document_path(&self) -> &str {
        &self.document_path
    }

    /// Add the security scheme and per-operation requirements to `doc`
    ///
    /// Returns the number of operations annotated.
    pub fn augment(&self, doc: &mut Value) -> usize {
        if !doc.is_object() {
            return 0;
        }
        if !doc["components"].is_object() {
            doc["components"] = json!({});
        }
        if !doc["components"]["securitySchemes"].is_object() {
            doc["components"]["securitySchemes"] = json!({});
        }
        doc["components"]["securitySchemes"][self.scheme_name.as_str()] = json!({
            "type": "openIdConnect",
            "openIdConnectUrl": self.discovery_url,
        });

        let Some(paths) = doc.get_mut("paths").and_then(Value::as_object_mut) else {
            return 0;
        };

        let mut annotated = 0;
        for (path, item) in paths.iter_mut() {
            let Some(item) = item.as_object_mut() else {
                continue;
            };
            for (key, operation) in item.iter_mut() {
                if !OPERATION_KEYS.contains(&key.as_str()) {
                    continue;
                }
                let Ok(method) = Method::from_bytes(key.to_ascii_uppercase().as_bytes()) else {
                    continue;
                };
                let Requirement::Token { scopes } = self.policy.decide(path, &method) else {
                    continue;
                };
                let Some(operation) = operation.as_object_mut() else {
                    continue;
                };

                let security = operation
                    .entry("security")
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(requirements) = security {
                    let mut requirement = Map::new();
                    requirement.insert(self.scheme_name.clone(), json!(scopes));
                    requirements.push(Value::Object(requirement));
                    annotated += 1;
                }
            }
        }
        annotated
    }
}

/// Augment the OpenAPI document on its way back to the client
pub async fn augment_openapi(
    State(augmenter): State<Arc<OpenApiAugmenter>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::GET || request.uri().path() != augmenter.document_path() {
        return next.run(request).await;
    }

    let response = next.run(request).await;
    if !response.status().is_success() || !is_json_response(response.headers()) {
        return response;
    }
    if declared_length(response.headers()).is_some_and(|len| len > augmenter.max_body_bytes as u64) {
        warn!("OpenAPI document exceeds the body limit; serving unchanged");
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match read_capped(body, augmenter.max_body_bytes).await {
        Ok(CappedBody::Complete(bytes)) => bytes,
        Ok(CappedBody::Oversized(body)) => {
            warn!("OpenAPI document exceeds the body limit; serving unchanged");
            return Response::from_parts(parts, body);
        }
        Err(e) => {
            warn!("Upstream failed while sending the OpenAPI document: {}", e);
            return ProxyError::UpstreamUnavailable(e.to_string()).into_response();
        }
    };

    let Ok(mut doc) = serde_json::from_slice::<Value>(&bytes) else {
        warn!("Upstream OpenAPI document is not valid JSON; serving unchanged");
        return rebuild_response(parts, bytes);
    };
    let annotated = augmenter.augment(&mut doc);
    debug!("Annotated {} OpenAPI operations with security requirements", annotated);

    match serde_json::to_vec(&doc) {
        Ok(body) => rebuild_response(parts, body.into()),
        Err(_) => rebuild_response(parts, bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MethodSpec, ScopeList, default_private_endpoints, default_public_endpoints};
    use crate::routes::MatchMode;

    fn augmenter(default_public: bool) -> OpenApiAugmenter {
        let mut private = default_private_endpoints();
        private.insert(
            r"^/collections/([^/]+)/items/([^/]+)$".to_string(),
            vec![MethodSpec::Scoped(
                "DELETE".into(),
                ScopeList::Joined("item:delete".into()),
            )],
        );
        let policy = AuthPolicy::from_tables(
            MatchMode::Prefix,
            &private,
            &default_public_endpoints(),
            default_public,
        )
        .unwrap();
        OpenApiAugmenter::new(
            "/api",
            "https://auth.example.com/.well-known/openid-configuration",
            "oidcAuth",
            Arc::new(policy),
            1024 * 1024,
        )
    }

    fn document() -> Value {
        json!({
            "openapi": "3.0.2",
            "paths": {
                "/collections": {
                    "get": {"summary": "list"},
                    "post": {"summary": "create"},
                },
                "/collections/{collection_id}/items/{item_id}": {
                    "parameters": [],
                    "get": {},
                    "delete": {"security": [{"apiKey": []}]},
                },
                "/api": {"get": {}},
            }
        })
    }

    #[test]
    fn test_adds_security_scheme() {
        let mut doc = document();
        augmenter(true).augment(&mut doc);
        assert_eq!(
            doc["components"]["securitySchemes"]["oidcAuth"],
            json!({
                "type": "openIdConnect",
                "openIdConnectUrl": "https://auth.example.com/.well-known/openid-configuration"
            })
        );
    }

    #[test]
    fn test_annotates_private_operations_with_scopes() {
        let mut doc = document();
        let annotated = augmenter(true).augment(&mut doc);
        assert_eq!(annotated, 2);

        let paths = &doc["paths"];
        assert!(paths["/collections"]["get"].get("security").is_none());
        assert_eq!(paths["/collections"]["post"]["security"], json!([{"oidcAuth": []}]));
        assert_eq!(
            paths["/collections/{collection_id}/items/{item_id}"]["delete"]["security"],
            json!([{"apiKey": []}, {"oidcAuth": ["item:delete"]}])
        );
        assert!(paths["/api"]["get"].get("security").is_none());
    }

    #[test]
    fn test_private_default_annotates_unmatched_paths() {
        let mut doc = document();
        augmenter(false).augment(&mut doc);
        assert_eq!(
            doc["paths"]["/collections"]["get"]["security"],
            json!([{"oidcAuth": []}])
        );
        assert!(doc["paths"]["/api"]["get"].get("security").is_none());
    }

    #[test]
    fn test_non_object_document_is_ignored() {
        let mut doc = json!(["not", "openapi"]);
        assert_eq!(augmenter(true).augment(&mut doc), 0);
    }
}
