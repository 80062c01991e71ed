//! Configuration management
//!
//! [`ProxyConfig`] is the single configuration value for the proxy. Endpoint
//! tables and filter settings arrive as JSON documents (usually from
//! environment variables) and are parsed here; everything is checked once at
//! startup and treated as immutable afterwards.

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::filters::FilterShape;
use crate::routes::{MatchMode, MethodRule, RouteError};

/// Configuration error; always fatal at startup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} is not valid JSON: {source}")]
    InvalidJson {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("unknown filter class {0:?}")]
    UnknownFilterClass(String),

    #[error("invalid arguments for filter {class}: {message}")]
    InvalidFilterArgs { class: String, message: String },

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("{0}")]
    Invalid(String),
}

/// Scopes attached to a method, space separated or as a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeList {
    Joined(String),
    List(Vec<String>),
}

impl ScopeList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::Joined(s) => s.split_whitespace().map(str::to_string).collect(),
            Self::List(items) => items.clone(),
        }
    }
}

/// Method entry of an endpoint table: `"GET"` or `["POST", "scope:a scope:b"]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MethodSpec {
    Method(String),
    Scoped(String, ScopeList),
}

impl MethodSpec {
    pub fn to_rule(&self) -> Result<MethodRule, RouteError> {
        match self {
            Self::Method(method) => MethodRule::new(method, Vec::new()),
            Self::Scoped(method, scopes) => MethodRule::new(method, scopes.to_vec()),
        }
    }
}

/// Path regex to permitted methods, in evaluation order
pub type EndpointMethods = IndexMap<String, Vec<MethodSpec>>;

/// One row of a filter-endpoint table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterEndpoint {
    pub pattern: String,
    pub methods: Vec<String>,
    pub shape: FilterShape,
}

impl FilterEndpoint {
    fn new(pattern: &str, methods: &[&str], shape: FilterShape) -> Self {
        Self {
            pattern: pattern.to_string(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            shape,
        }
    }
}

/// Filter factory selection: class identifier plus constructor arguments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub class: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl FilterConfig {
    /// Build from the raw `*_FILTER_CLS`, `*_FILTER_ARGS` and `*_FILTER_KWARGS` values
    pub fn from_parts(
        class: &str,
        args: Option<&str>,
        kwargs: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let args = match args {
            Some(raw) if !raw.trim().is_empty() => parse_json("filter args", raw)?,
            _ => Vec::new(),
        };
        let kwargs = match kwargs {
            Some(raw) if !raw.trim().is_empty() => parse_json("filter kwargs", raw)?,
            _ => Map::new(),
        };
        Ok(Self {
            class: class.to_string(),
            args,
            kwargs,
        })
    }
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Base URL of the upstream STAC API
    pub upstream_url: String,
    /// Public OIDC discovery document URL
    pub oidc_discovery_url: String,
    /// Discovery URL reachable from inside the deployment network
    pub oidc_discovery_internal_url: Option<String>,
    /// Accepted token audiences; empty skips the audience check
    pub allowed_jwt_audiences: Vec<String>,
    /// Timeout for each discovery or JWKS request, in milliseconds
    pub oidc_timeout_ms: u64,

    /// Whether routes matching neither endpoint table are public
    pub default_public: bool,
    pub private_endpoints: EndpointMethods,
    pub public_endpoints: EndpointMethods,
    pub route_match_mode: MatchMode,

    pub items_filter: Option<FilterConfig>,
    pub items_filter_endpoints: Vec<FilterEndpoint>,
    pub collections_filter: Option<FilterConfig>,
    pub collections_filter_endpoints: Vec<FilterEndpoint>,

    /// Path of the upstream OpenAPI document to augment; `None` disables it
    pub openapi_spec_endpoint: Option<String>,
    pub openapi_auth_scheme_name: String,

    /// Answer OPTIONS requests with the caller's permitted methods
    pub enable_auth_options: bool,
    /// Rewrite upstream links in JSON responses to point at the proxy
    pub rewrite_links: bool,
    /// Advertise auth requirements with the STAC authentication extension
    pub enable_authentication_extension: bool,
    /// Path prefix the proxy is mounted under, used for link rewriting
    pub root_path: String,

    pub upstream_timeout_secs: u64,
    /// Largest request or response body buffered for inspection
    pub max_body_bytes: usize,
    pub cors_origins: Vec<String>,

    pub host: String,
    pub port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_url: "http://localhost:8080".to_string(),
            oidc_discovery_url: String::new(),
            oidc_discovery_internal_url: None,
            allowed_jwt_audiences: Vec::new(),
            oidc_timeout_ms: 5000,
            default_public: false,
            private_endpoints: default_private_endpoints(),
            public_endpoints: default_public_endpoints(),
            route_match_mode: MatchMode::Prefix,
            items_filter: None,
            items_filter_endpoints: default_items_filter_endpoints(),
            collections_filter: None,
            collections_filter_endpoints: default_collections_filter_endpoints(),
            openapi_spec_endpoint: Some("/api".to_string()),
            openapi_auth_scheme_name: "oidcAuth".to_string(),
            enable_auth_options: false,
            rewrite_links: true,
            enable_authentication_extension: true,
            root_path: String::new(),
            upstream_timeout_secs: 15,
            max_body_bytes: 10 * 1024 * 1024,
            cors_origins: vec!["*".to_string()],
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl ProxyConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn oidc_timeout(&self) -> Duration {
        Duration::from_millis(self.oidc_timeout_ms)
    }

    /// Check settings that serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.upstream_url)
            .map_err(|e| ConfigError::Invalid(format!("upstream_url: {}", e)))?;
        url::Url::parse(&self.oidc_discovery_url)
            .map_err(|e| ConfigError::Invalid(format!("oidc_discovery_url: {}", e)))?;
        if let Some(internal) = &self.oidc_discovery_internal_url {
            url::Url::parse(internal).map_err(|e| {
                ConfigError::Invalid(format!("oidc_discovery_internal_url: {}", e))
            })?;
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::Invalid("max_body_bytes must be positive".into()));
        }
        if !self.root_path.is_empty() && !self.root_path.starts_with('/') {
            return Err(ConfigError::Invalid("root_path must start with '/'".into()));
        }
        Ok(())
    }
}

/// Parse a JSON-valued setting, naming the setting on failure
pub fn parse_json<T: serde::de::DeserializeOwned>(
    field: &'static str,
    raw: &str,
) -> Result<T, ConfigError> {
    serde_json::from_str(raw).map_err(|source| ConfigError::InvalidJson { field, source })
}

pub fn default_private_endpoints() -> EndpointMethods {
    let methods = |names: &[&str]| {
        names
            .iter()
            .map(|m| MethodSpec::Method(m.to_string()))
            .collect::<Vec<_>>()
    };
    IndexMap::from([
        (r"^/collections$".to_string(), methods(&["POST"])),
        (
            r"^/collections/([^/]+)$".to_string(),
            methods(&["PUT", "PATCH", "DELETE"]),
        ),
        (r"^/collections/([^/]+)/items$".to_string(), methods(&["POST"])),
        (
            r"^/collections/([^/]+)/items/([^/]+)$".to_string(),
            methods(&["PUT", "PATCH", "DELETE"]),
        ),
        (r"^/collections/([^/]+)/bulk_items$".to_string(), methods(&["POST"])),
    ])
}

pub fn default_public_endpoints() -> EndpointMethods {
    IndexMap::from([
        (r"^/api.html$".to_string(), vec![MethodSpec::Method("GET".into())]),
        (r"^/api$".to_string(), vec![MethodSpec::Method("GET".into())]),
    ])
}

pub fn default_items_filter_endpoints() -> Vec<FilterEndpoint> {
    vec![
        FilterEndpoint::new(r"^/search$", &["GET", "POST"], FilterShape::Search),
        FilterEndpoint::new(
            r"^/collections/(?P<collection_id>[^/]+)/items$",
            &["GET", "POST"],
            FilterShape::List,
        ),
        FilterEndpoint::new(
            r"^/collections/(?P<collection_id>[^/]+)/items/(?P<item_id>[^/]+)$",
            &["GET", "PUT", "PATCH", "DELETE"],
            FilterShape::Record,
        ),
    ]
}

pub fn default_collections_filter_endpoints() -> Vec<FilterEndpoint> {
    vec![
        FilterEndpoint::new(r"^/collections$", &["GET", "POST"], FilterShape::List),
        FilterEndpoint::new(
            r"^/collections/(?P<collection_id>[^/]+)$",
            &["GET", "PUT", "PATCH", "DELETE"],
            FilterShape::Record,
        ),
    ]
}
