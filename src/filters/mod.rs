//! Record-level filter factories
//!
//! A [`FilterFactory`] turns the context of a request into a CQL2
//! [`FilterExpression`]. Factories are constructed once at startup from a
//! [`FilterConfig`] through the [`FilterRegistry`] and then shared across all
//! requests, so `generate` must be safe to call concurrently.
//!
//! Factories embedding caller-controlled values (claims, headers) should
//! build structured expressions rather than interpolating text.

pub mod expression;
pub mod lookup;
pub mod opa;
pub mod template;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub use expression::{ExpressionError, FilterExpression};

use crate::config::{ConfigError, FilterConfig};

/// Failure to produce a filter for a request
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("template rendering failed: {0}")]
    Render(String),

    #[error("remote filter service failed: {0}")]
    Remote(String),

    #[error("remote filter service timed out")]
    Timeout,

    #[error("filter output unusable: {0}")]
    InvalidOutput(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

impl From<reqwest::Error> for FilterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Remote(err.to_string())
        }
    }
}

/// Which kind of resource a filter governs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterTarget {
    Items,
    Collections,
}

/// Cardinality of the endpoint a filter applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterShape {
    /// Cross-collection search (`/search`)
    Search,
    /// A listing that also accepts creates (`/collections`, `.../items`)
    List,
    /// A single record
    Record,
}

/// Request fields visible to filter factories
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestInfo {
    pub path: String,
    pub method: String,
    pub query_params: IndexMap<String, String>,
    pub path_params: HashMap<String, String>,
    /// Header names are lowercase
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

/// Everything a factory may base its decision on
///
/// Serializes as `{"req": {...}, "payload": {...} | null}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestContext {
    pub req: RequestInfo,
    /// Verified token claims, absent for anonymous requests
    pub payload: Option<Map<String, Value>>,
}

impl RequestContext {
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.req.headers.get("authorization")?;
        let (scheme, token) = value.split_once(' ')?;
        scheme.eq_ignore_ascii_case("bearer").then_some(token.trim())
    }

    /// Stable digest of the caller identity and request target
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.bearer_token().unwrap_or("").as_bytes());
        hasher.update([0]);
        hasher.update(self.req.method.as_bytes());
        hasher.update([0]);
        hasher.update(self.req.path.as_bytes());
        for (key, value) in &self.req.query_params {
            hasher.update([0]);
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Produces the CQL2 filter for a request
#[async_trait]
pub trait FilterFactory: Send + Sync {
    async fn generate(&self, ctx: &RequestContext) -> Result<FilterExpression, FilterError>;
}

/// Constructs a factory from its configuration
pub type FactoryConstructor = fn(&FilterConfig) -> Result<Arc<dyn FilterFactory>, ConfigError>;

/// Compiled-in table of filter factory classes
pub struct FilterRegistry {
    constructors: HashMap<String, FactoryConstructor>,
}

impl FilterRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry holding `template`, `opa` and `lookup`
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("template", template::TemplateFilter::from_config);
        registry.register("opa", opa::OpaFilter::from_config);
        registry.register("lookup", lookup::LookupFilter::from_config);
        registry
    }

    pub fn register(&mut self, class: &str, constructor: FactoryConstructor) {
        self.constructors
            .insert(normalize_class(class), constructor);
    }

    pub fn build(&self, config: &FilterConfig) -> Result<Arc<dyn FilterFactory>, ConfigError> {
        let class = normalize_class(&config.class);
        let constructor = self
            .constructors
            .get(&class)
            .ok_or_else(|| ConfigError::UnknownFilterClass(config.class.clone()))?;
        constructor(config)
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// `stac_auth_proxy.filters:Template` and `Template` both name `template`
fn normalize_class(class: &str) -> String {
    class
        .rsplit([':', '.'])
        .next()
        .unwrap_or(class)
        .trim()
        .to_ascii_lowercase()
}

/// Positional argument `index` or keyword `name`, as a string
pub(crate) fn string_arg(
    config: &FilterConfig,
    index: usize,
    name: &str,
) -> Result<String, ConfigError> {
    config
        .args
        .get(index)
        .or_else(|| config.kwargs.get(name))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ConfigError::InvalidFilterArgs {
            class: config.class.clone(),
            message: format!("missing string argument {:?} (position {})", name, index),
        })
}

/// Optional keyword argument `name` in (possibly fractional) seconds
pub(crate) fn seconds_kwarg(
    config: &FilterConfig,
    name: &str,
) -> Result<Option<std::time::Duration>, ConfigError> {
    match config.kwargs.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .filter(|secs| *secs >= 0.0 && secs.is_finite())
            .map(|secs| Some(std::time::Duration::from_secs_f64(secs)))
            .ok_or_else(|| ConfigError::InvalidFilterArgs {
                class: config.class.clone(),
                message: format!("{} must be a non-negative number of seconds", name),
            }),
    }
}
