//! STAC Auth Proxy - Main binary

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use stac_auth_proxy::config::{FilterConfig, parse_json};
use stac_auth_proxy::routes::MatchMode;
use stac_auth_proxy::{ProxyConfig, ProxyServer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "stac-auth-proxy")]
#[command(about = "Authentication, authorization and record-level filtering for STAC APIs")]
#[command(version)]
struct Cli {
    /// Base URL of the upstream STAC API
    #[arg(long, env = "UPSTREAM_URL")]
    upstream_url: String,

    /// OpenID Connect discovery document URL
    #[arg(long, env = "OIDC_DISCOVERY_URL")]
    oidc_discovery_url: String,

    /// Discovery URL reachable from inside the deployment, if different
    #[arg(long, env = "OIDC_DISCOVERY_INTERNAL_URL")]
    oidc_discovery_internal_url: Option<String>,

    /// Accepted token audiences (comma separated); empty disables the check
    #[arg(long, env = "ALLOWED_JWT_AUDIENCES", value_delimiter = ',')]
    allowed_jwt_audiences: Vec<String>,

    /// Treat routes matching no rule as public
    #[arg(long, env = "DEFAULT_PUBLIC", default_value_t = false, action = ArgAction::Set)]
    default_public: bool,

    /// JSON object of public endpoint patterns to methods
    #[arg(long, env = "PUBLIC_ENDPOINTS")]
    public_endpoints: Option<String>,

    /// JSON object of private endpoint patterns to methods (and scopes)
    #[arg(long, env = "PRIVATE_ENDPOINTS")]
    private_endpoints: Option<String>,

    /// How route patterns are anchored: prefix or full
    #[arg(long, env = "ROUTE_MATCH_MODE", default_value = "prefix", value_parser = ["prefix", "full"])]
    route_match_mode: String,

    /// Filter factory class for items
    #[arg(long, env = "ITEMS_FILTER_CLS")]
    items_filter_cls: Option<String>,

    /// JSON array of positional arguments for the items filter
    #[arg(long, env = "ITEMS_FILTER_ARGS")]
    items_filter_args: Option<String>,

    /// JSON object of keyword arguments for the items filter
    #[arg(long, env = "ITEMS_FILTER_KWARGS")]
    items_filter_kwargs: Option<String>,

    /// JSON array overriding the endpoints the items filter applies to
    #[arg(long, env = "ITEMS_FILTER_ENDPOINTS")]
    items_filter_endpoints: Option<String>,

    /// Filter factory class for collections
    #[arg(long, env = "COLLECTIONS_FILTER_CLS")]
    collections_filter_cls: Option<String>,

    /// JSON array of positional arguments for the collections filter
    #[arg(long, env = "COLLECTIONS_FILTER_ARGS")]
    collections_filter_args: Option<String>,

    /// JSON object of keyword arguments for the collections filter
    #[arg(long, env = "COLLECTIONS_FILTER_KWARGS")]
    collections_filter_kwargs: Option<String>,

    /// JSON array overriding the endpoints the collections filter applies to
    #[arg(long, env = "COLLECTIONS_FILTER_ENDPOINTS")]
    collections_filter_endpoints: Option<String>,

    /// Path of the upstream OpenAPI document; empty disables augmentation
    #[arg(long, env = "OPENAPI_SPEC_ENDPOINT", default_value = "/api")]
    openapi_spec_endpoint: String,

    /// Security scheme name added to the OpenAPI document
    #[arg(long, env = "OPENAPI_AUTH_SCHEME_NAME", default_value = "oidcAuth")]
    openapi_auth_scheme_name: String,

    /// Answer OPTIONS requests with the caller's permitted methods
    #[arg(long, env = "ENABLE_AUTH_OPTIONS", default_value_t = false, action = ArgAction::Set)]
    enable_auth_options: bool,

    /// Rewrite upstream links in JSON responses
    #[arg(long, env = "REWRITE_LINKS", default_value_t = true, action = ArgAction::Set)]
    rewrite_links: bool,

    /// Add STAC authentication extension fields to catalog responses
    #[arg(long, env = "ENABLE_AUTHENTICATION_EXTENSION", default_value_t = true, action = ArgAction::Set)]
    enable_authentication_extension: bool,

    /// Path prefix the proxy is mounted under, used in rewritten links
    #[arg(long, env = "ROOT_PATH", default_value = "")]
    root_path: String,

    /// Discovery and JWKS request timeout in milliseconds
    #[arg(long, env = "OIDC_TIMEOUT_MS", default_value = "5000")]
    oidc_timeout_ms: u64,

    /// Upstream request timeout in seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value = "15")]
    upstream_timeout_secs: u64,

    /// Largest request or inspected response body, in bytes
    #[arg(long, env = "MAX_BODY_BYTES", default_value = "10485760")]
    max_body_bytes: usize,

    /// Allowed CORS origins (comma separated, `*` for any)
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,

    /// Host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind to
    #[arg(long, env = "PORT", default_value = "8000")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn filter_config(
    class: Option<&str>,
    args: Option<&str>,
    kwargs: Option<&str>,
) -> Result<Option<FilterConfig>> {
    match class.map(str::trim).filter(|c| !c.is_empty()) {
        Some(class) => Ok(Some(FilterConfig::from_parts(class, args, kwargs)?)),
        None => Ok(None),
    }
}

impl Cli {
    fn into_config(self) -> Result<ProxyConfig> {
        let defaults = ProxyConfig::default();

        let public_endpoints = match self.public_endpoints.as_deref() {
            Some(raw) => parse_json("PUBLIC_ENDPOINTS", raw)?,
            None => defaults.public_endpoints,
        };
        let private_endpoints = match self.private_endpoints.as_deref() {
            Some(raw) => parse_json("PRIVATE_ENDPOINTS", raw)?,
            None => defaults.private_endpoints,
        };
        let items_filter_endpoints = match self.items_filter_endpoints.as_deref() {
            Some(raw) => parse_json("ITEMS_FILTER_ENDPOINTS", raw)?,
            None => defaults.items_filter_endpoints,
        };
        let collections_filter_endpoints = match self.collections_filter_endpoints.as_deref() {
            Some(raw) => parse_json("COLLECTIONS_FILTER_ENDPOINTS", raw)?,
            None => defaults.collections_filter_endpoints,
        };

        let items_filter = filter_config(
            self.items_filter_cls.as_deref(),
            self.items_filter_args.as_deref(),
            self.items_filter_kwargs.as_deref(),
        )
        .context("ITEMS_FILTER_* settings")?;
        let collections_filter = filter_config(
            self.collections_filter_cls.as_deref(),
            self.collections_filter_args.as_deref(),
            self.collections_filter_kwargs.as_deref(),
        )
        .context("COLLECTIONS_FILTER_* settings")?;

        let route_match_mode = match self.route_match_mode.as_str() {
            "full" => MatchMode::Full,
            _ => MatchMode::Prefix,
        };

        Ok(ProxyConfig {
            upstream_url: self.upstream_url,
            oidc_discovery_url: self.oidc_discovery_url,
            oidc_discovery_internal_url: self
                .oidc_discovery_internal_url
                .filter(|url| !url.trim().is_empty()),
            allowed_jwt_audiences: self
                .allowed_jwt_audiences
                .into_iter()
                .map(|aud| aud.trim().to_string())
                .filter(|aud| !aud.is_empty())
                .collect(),
            oidc_timeout_ms: self.oidc_timeout_ms,
            default_public: self.default_public,
            private_endpoints,
            public_endpoints,
            route_match_mode,
            items_filter,
            items_filter_endpoints,
            collections_filter,
            collections_filter_endpoints,
            openapi_spec_endpoint: Some(self.openapi_spec_endpoint)
                .filter(|path| !path.trim().is_empty()),
            openapi_auth_scheme_name: self.openapi_auth_scheme_name,
            enable_auth_options: self.enable_auth_options,
            rewrite_links: self.rewrite_links,
            enable_authentication_extension: self.enable_authentication_extension,
            root_path: self.root_path,
            upstream_timeout_secs: self.upstream_timeout_secs,
            max_body_bytes: self.max_body_bytes,
            cors_origins: self.cors_origins,
            host: self.host,
            port: self.port,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::EnvFilter::new(&cli.log_level))
        .init();

    info!("Starting STAC auth proxy v{}", stac_auth_proxy::VERSION);

    let config = cli.into_config().context("Invalid configuration")?;
    info!(
        "Upstream {}, default policy {}, items filter {}, collections filter {}",
        config.upstream_url,
        if config.default_public { "public" } else { "private" },
        config
            .items_filter
            .as_ref()
            .map_or("none", |f| f.class.as_str()),
        config
            .collections_filter
            .as_ref()
            .map_or("none", |f| f.class.as_str()),
    );

    let server = ProxyServer::new(config).context("Failed to build proxy")?;
    server.serve().await
}
