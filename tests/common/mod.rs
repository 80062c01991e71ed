//! Common test utilities for integration tests
//!
//! Every test gets two wiremock servers: an OpenID Connect provider serving
//! the fixture signing keys, and a stand-in upstream STAC API. The proxy
//! router is driven in-process with `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderMap, Request, StatusCode, header},
};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{Map, Value, json};
use stac_auth_proxy::config::{FilterConfig, MethodSpec, ScopeList};
use stac_auth_proxy::{ProxyConfig, ProxyServer};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request as MockRequest, ResponseTemplate};

pub const KEY_ID: &str = "test-key-1";

/// Mock identity provider plus mock upstream API
pub struct TestEnv {
    pub provider: MockServer,
    pub upstream: MockServer,
}

impl TestEnv {
    pub async fn start() -> Self {
        let provider = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": provider.uri(),
                "jwks_uri": format!("{}/jwks", provider.uri()),
            })))
            .mount(&provider)
            .await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("cache-control", "max-age=300")
                    .set_body_json(jwks_fixture()),
            )
            .mount(&provider)
            .await;

        let upstream = MockServer::start().await;
        Self { provider, upstream }
    }

    pub fn discovery_url(&self) -> String {
        format!("{}/.well-known/openid-configuration", self.provider.uri())
    }

    /// Baseline configuration pointing at the mock servers
    pub fn config(&self) -> ProxyConfig {
        ProxyConfig {
            upstream_url: self.upstream.uri(),
            oidc_discovery_url: self.discovery_url(),
            ..ProxyConfig::default()
        }
    }

    pub fn router(&self, config: ProxyConfig) -> Router {
        ProxyServer::new(config)
            .expect("proxy should build from test config")
            .router()
    }

    /// Signed token with issuer, subject and a five minute lifetime, plus `extra`
    pub fn token(&self, extra: Value) -> String {
        let now = chrono::Utc::now().timestamp();
        let mut claims = Map::new();
        claims.insert("iss".into(), json!(self.provider.uri()));
        claims.insert("sub".into(), json!("user-1"));
        claims.insert("iat".into(), json!(now));
        claims.insert("exp".into(), json!(now + 300));
        if let Value::Object(extra) = extra {
            claims.extend(extra);
        }
        sign(&Value::Object(claims))
    }

    /// Requests the upstream received, in order
    pub async fn upstream_requests(&self) -> Vec<MockRequest> {
        self.upstream.received_requests().await.unwrap_or_default()
    }
}

pub fn jwks_fixture() -> Value {
    serde_json::from_str(include_str!("../fixtures/jwks.json")).expect("fixture JWKS is JSON")
}

/// Sign arbitrary claims with the fixture key
pub fn sign(claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KEY_ID.to_string());
    let key = EncodingKey::from_rsa_pem(include_bytes!("../fixtures/test_key.pem"))
        .expect("fixture key is a valid RSA PEM");
    jsonwebtoken::encode(&header, claims, &key).expect("token should sign")
}

/// Template filter configuration
pub fn template_filter(template: &str) -> FilterConfig {
    FilterConfig {
        class: "template".into(),
        args: vec![json!(template)],
        ..Default::default()
    }
}

pub fn method_spec(method: &str) -> MethodSpec {
    MethodSpec::Method(method.into())
}

pub fn scoped(method: &str, scopes: &str) -> MethodSpec {
    MethodSpec::Scoped(method.into(), ScopeList::Joined(scopes.into()))
}

/// Request builder shortcut
pub fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let body = match body {
        Some(body) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    builder.body(body).expect("test request should build")
}

/// Response status, headers and body (JSON when it parses, else a string)
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

pub async fn send(router: &Router, request: Request<Body>) -> TestResponse {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router is infallible");
    let (parts, body) = response.into_parts();
    let bytes = to_bytes(body, usize::MAX).await.expect("body should buffer");
    let body = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    TestResponse {
        status: parts.status,
        headers: parts.headers,
        body,
    }
}

/// Query parameters of a request the upstream received
pub fn query_pairs(request: &MockRequest) -> Vec<(String, String)> {
    request
        .url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

pub fn json_body(request: &MockRequest) -> Value {
    serde_json::from_slice(&request.body).expect("upstream received a JSON body")
}
