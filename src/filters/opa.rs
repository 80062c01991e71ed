//! Open Policy Agent backed filters
//!
//! POSTs `{"input": <request context>}` to `{host}/v1/data/{decision}` and
//! reads a CQL2 expression (text or JSON) from the `result` field. Decisions
//! may be cached per caller and target with the `cache_ttl` keyword argument
//! (seconds, default 0 meaning no caching).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{
    FilterError, FilterExpression, FilterFactory, RequestContext, seconds_kwarg, string_arg,
};
use crate::cache::TtlCache;
use crate::config::{ConfigError, FilterConfig};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct DecisionResponse {
    result: Option<Value>,
}

pub struct OpaFilter {
    decision_url: String,
    http: reqwest::Client,
    cache: Arc<TtlCache<String, FilterExpression>>,
    cache_ttl: Duration,
}

impl OpaFilter {
    pub fn new(
        host: &str,
        decision: &str,
        cache_ttl: Duration,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("OPA client: {}", e)))?;

        // Keyed per caller and target, so distinct entries accumulate quickly.
        let cache = Arc::new(TtlCache::new());
        cache.sweep_for_ttl(cache_ttl);

        Ok(Self {
            decision_url: format!(
                "{}/v1/data/{}",
                host.trim_end_matches('/'),
                decision.trim_matches('/')
            ),
            http,
            cache,
            cache_ttl,
        })
    }

    /// Arguments: `[host, decision]`; keywords `cache_ttl` and `timeout` in seconds
    pub fn from_config(config: &FilterConfig) -> Result<Arc<dyn FilterFactory>, ConfigError> {
        let host = string_arg(config, 0, "host")?;
        let decision = string_arg(config, 1, "decision")?;
        let cache_ttl = seconds_kwarg(config, "cache_ttl")?.unwrap_or(Duration::ZERO);
        let timeout = seconds_kwarg(config, "timeout")?.unwrap_or(DEFAULT_TIMEOUT);
        Ok(Arc::new(Self::new(&host, &decision, cache_ttl, timeout)?))
    }

    async fn evaluate(&self, ctx: &RequestContext) -> Result<FilterExpression, FilterError> {
        debug!("Requesting filter decision from {}", self.decision_url);
        let response = self
            .http
            .post(&self.decision_url)
            .json(&json!({ "input": ctx }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!("Policy decision request returned {}", status);
            return Err(FilterError::Remote(format!("decision endpoint returned {}", status)));
        }

        let decision: DecisionResponse = response.json().await?;
        let result = decision
            .result
            .filter(|v| !v.is_null())
            .ok_or_else(|| FilterError::InvalidOutput("decision has no result".into()))?;
        Ok(FilterExpression::from_value(&result)?)
    }
}

#[async_trait]
impl FilterFactory for OpaFilter {
    async fn generate(&self, ctx: &RequestContext) -> Result<FilterExpression, FilterError> {
        if self.cache_ttl.is_zero() {
            return self.evaluate(ctx).await;
        }
        self.cache
            .get_or_try_insert_with(ctx.fingerprint(), self.cache_ttl, || self.evaluate(ctx))
            .await
    }
}
