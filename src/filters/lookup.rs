//! Identifier-lookup filters
//!
//! Resolves the identifiers a caller may access by calling an external API
//! with the caller's bearer token, then restricts records to those whose
//! property is one of the identifiers. Results are cached per token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{
    FilterError, FilterExpression, FilterFactory, RequestContext, seconds_kwarg, string_arg,
};
use crate::cache::TtlCache;
use crate::config::{ConfigError, FilterConfig};

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lookup responses are either a bare list or `{"ids": [...]}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LookupResponse {
    List(Vec<Value>),
    Wrapped { ids: Vec<Value> },
}

impl LookupResponse {
    fn into_ids(self) -> Vec<String> {
        let values = match self {
            Self::List(ids) | Self::Wrapped { ids } => ids,
        };
        values
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()
    }
}

pub struct LookupFilter {
    url: String,
    property: String,
    http: reqwest::Client,
    cache: Arc<TtlCache<String, Arc<Vec<String>>>>,
    cache_ttl: Duration,
}

impl LookupFilter {
    pub fn new(
        url: &str,
        property: &str,
        cache_ttl: Duration,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("lookup client: {}", e)))?;

        // Keyed per token.
        let cache = Arc::new(TtlCache::new());
        cache.sweep_for_ttl(cache_ttl);

        Ok(Self {
            url: url.to_string(),
            property: property.to_string(),
            http,
            cache,
            cache_ttl,
        })
    }

    /// Arguments: `[url, property]`; keywords `cache_ttl` (default 60) and `timeout` in seconds
    pub fn from_config(config: &FilterConfig) -> Result<Arc<dyn FilterFactory>, ConfigError> {
        let url = string_arg(config, 0, "url")?;
        let property = string_arg(config, 1, "property")?;
        let cache_ttl = seconds_kwarg(config, "cache_ttl")?.unwrap_or(DEFAULT_CACHE_TTL);
        let timeout = seconds_kwarg(config, "timeout")?.unwrap_or(DEFAULT_TIMEOUT);
        Ok(Arc::new(Self::new(&url, &property, cache_ttl, timeout)?))
    }

    async fn fetch_ids(&self, token: Option<&str>) -> Result<Arc<Vec<String>>, FilterError> {
        debug!("Resolving permitted identifiers from {}", self.url);
        let mut request = self.http.get(&self.url);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("Identifier lookup returned {}", status);
            return Err(FilterError::Remote(format!("lookup returned {}", status)));
        }

        let body: LookupResponse = response
            .json()
            .await
            .map_err(|e| FilterError::InvalidOutput(e.to_string()))?;
        Ok(Arc::new(body.into_ids()))
    }

    fn build_expression(&self, ids: &[String]) -> Result<FilterExpression, FilterError> {
        if ids.is_empty() {
            return Ok(FilterExpression::parse("false")?);
        }
        Ok(FilterExpression::from_value(&json!({
            "op": "in",
            "args": [{"property": self.property}, ids],
        }))?)
    }
}

#[async_trait]
impl FilterFactory for LookupFilter {
    async fn generate(&self, ctx: &RequestContext) -> Result<FilterExpression, FilterError> {
        let token = ctx.bearer_token();
        let key = format!("{:x}", Sha256::digest(token.unwrap_or("").as_bytes()));

        let ids = self
            .cache
            .get_or_try_insert_with(key, self.cache_ttl, || self.fetch_ids(token))
            .await?;
        self.build_expression(&ids)
    }
}
