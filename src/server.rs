//! Router assembly and the serve loop

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::Response,
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::{Any, CorsLayer};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::{ConfigError, ProxyConfig};
use crate::filters::FilterRegistry;
use crate::openapi::{OpenApiAugmenter, augment_openapi};
use crate::pipeline::{
    apply::{ApplyState, apply_filter},
    auth_extension::{AuthExtension, add_auth_extension},
    build::{FilterState, build_filter},
    links::{LinkRewriter, rewrite_links},
    options::auth_options,
};
use crate::proxy::{UpstreamClient, proxy_handler};
use crate::security::auth::{TokenValidator, TokenValidatorConfig};
use crate::security::enforce::{AuthPolicy, AuthState, enforce_auth};
use crate::security::jwks::{KeyStore, KeyStoreConfig};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Fully assembled proxy, ready to serve
pub struct ProxyServer {
    config: ProxyConfig,
    router: Router,
}

impl ProxyServer {
    /// Build the proxy with the built-in filter factories
    pub fn new(config: ProxyConfig) -> Result<Self, ConfigError> {
        Self::with_registry(config, &FilterRegistry::builtin())
    }

    /// Build the proxy, resolving filter classes through `registry`
    pub fn with_registry(
        config: ProxyConfig,
        registry: &FilterRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let upstream = Arc::new(UpstreamClient::new(
            &config.upstream_url,
            config.upstream_timeout(),
            config.max_body_bytes,
        )?);

        let key_store = KeyStore::new(
            KeyStoreConfig::new(config.oidc_discovery_url.clone())
                .with_internal_url(config.oidc_discovery_internal_url.clone())
                .with_request_timeout(config.oidc_timeout()),
        )
        .map_err(|e| ConfigError::Invalid(format!("key store: {}", e)))?;
        let validator = Arc::new(TokenValidator::new(
            Arc::new(key_store),
            TokenValidatorConfig {
                audiences: config.allowed_jwt_audiences.clone(),
                ..TokenValidatorConfig::default()
            },
        ));

        let policy = Arc::new(AuthPolicy::from_tables(
            config.route_match_mode,
            &config.private_endpoints,
            &config.public_endpoints,
            config.default_public,
        )?);

        let filter_state = Arc::new(FilterState::from_config(&config, registry)?);
        let apply_state = ApplyState {
            upstream: upstream.clone(),
            max_body_bytes: config.max_body_bytes,
        };

        let mut router = Router::new()
            .fallback(proxy_handler)
            .with_state(upstream.clone())
            .layer(middleware::from_fn_with_state(apply_state, apply_filter))
            .layer(middleware::from_fn_with_state(filter_state, build_filter));

        let auth_state = AuthState {
            policy: policy.clone(),
            validator,
        };
        router = router.layer(middleware::from_fn_with_state(auth_state.clone(), enforce_auth));

        if let Some(document_path) = &config.openapi_spec_endpoint {
            let augmenter = Arc::new(OpenApiAugmenter::new(
                document_path,
                &config.oidc_discovery_url,
                &config.openapi_auth_scheme_name,
                policy.clone(),
                config.max_body_bytes,
            ));
            router = router.layer(middleware::from_fn_with_state(augmenter, augment_openapi));
        }

        // Inside link rewriting, so link targets are still upstream URLs.
        if config.enable_authentication_extension {
            let extension = Arc::new(AuthExtension::new(
                &config.oidc_discovery_url,
                &config.openapi_auth_scheme_name,
                policy,
                upstream.base_url(),
                config.max_body_bytes,
            ));
            router = router.layer(middleware::from_fn_with_state(extension, add_auth_extension));
        }

        if config.rewrite_links {
            let rewriter = Arc::new(LinkRewriter::new(
                upstream.base_url().clone(),
                &config.root_path,
                config.max_body_bytes,
            ));
            router = router.layer(middleware::from_fn_with_state(rewriter, rewrite_links));
        }

        router = router.layer(cors_layer(&config.cors_origins));
        if config.enable_auth_options {
            router = router.layer(middleware::from_fn_with_state(auth_state, auth_options));
        }
        let router = router.layer(middleware::from_fn(trace_request));

        Ok(Self { config, router })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// The assembled router, for in-process use
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Bind and serve until Ctrl+C
    pub async fn serve(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind proxy to {}", addr))?;

        info!(
            "STAC auth proxy v{} listening on http://{} -> {}",
            crate::VERSION,
            addr,
            self.config.upstream_url
        );

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

        info!("Proxy stopped");
        Ok(())
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let allowed: Vec<hyper::http::HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<hyper::http::HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    cors.allow_origin(allowed)
}

/// Correlation id, request span and access log
async fn trace_request(mut request: Request, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| !id.is_empty() && id.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let header_value = HeaderValue::from_str(&correlation_id).ok();
    if let Some(value) = &header_value {
        request
            .headers_mut()
            .insert(HeaderName::from_static(CORRELATION_HEADER), value.clone());
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let span = info_span!("request", id = %correlation_id, %method, %path);
    let started = Instant::now();

    let mut response = next.run(request).instrument(span.clone()).await;

    let status = response.status();
    span.in_scope(|| {
        if status.is_server_error() {
            error!("{} {} -> {} in {:?}", method, path, status, started.elapsed());
        } else {
            info!("{} {} -> {} in {:?}", method, path, status, started.elapsed());
        }
    });

    if let Some(value) = header_value {
        response
            .headers_mut()
            .insert(HeaderName::from_static(CORRELATION_HEADER), value);
    }
    response
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully"),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{StatusCode, header};
    use tower::ServiceExt;

    fn config() -> ProxyConfig {
        ProxyConfig {
            upstream_url: "http://127.0.0.1:9".into(),
            oidc_discovery_url: "http://127.0.0.1:9/.well-known/openid-configuration".into(),
            ..ProxyConfig::default()
        }
    }

    #[test]
    fn test_rejects_unknown_filter_class() {
        let mut config = config();
        config.items_filter = Some(crate::config::FilterConfig {
            class: "does-not-exist".into(),
            ..Default::default()
        });
        assert!(matches!(
            ProxyServer::new(config),
            Err(ConfigError::UnknownFilterClass(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_route_pattern() {
        let mut config = config();
        config
            .private_endpoints
            .insert("^/broken($".into(), vec![crate::config::MethodSpec::Method("GET".into())]);
        assert!(matches!(ProxyServer::new(config), Err(ConfigError::Route(_))));
    }

    #[tokio::test]
    async fn test_private_route_without_token_is_rejected_before_upstream() {
        let router = ProxyServer::new(config()).unwrap().router();
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/collections")
                    .header(CORRELATION_HEADER, "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
        assert_eq!(response.headers()[CORRELATION_HEADER], "abc-123");
    }

    #[test]
    fn test_cors_layer_accepts_explicit_origins() {
        let _ = cors_layer(&["https://app.example.com".to_string(), "bad\norigin".to_string()]);
        let _ = cors_layer(&["*".to_string()]);
    }
}
