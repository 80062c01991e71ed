//! Signing key discovery and caching
//!
//! [`KeyStore`] resolves the OIDC discovery document (preferring the internal
//! URL when one is configured), follows its `jwks_uri`, and keeps the
//! resulting [`SigningKeySet`] until it expires. Refreshes are single-flight:
//! the first caller to see a missing or expired set performs the fetch and
//! every concurrent caller waits for that result instead of fetching again.
//! A failed refresh is shared the same way: callers that queued behind it get
//! its error rather than repeating the retry loop.
//!
//! Key set lifetime follows `Cache-Control: max-age` on the JWKS response,
//! clamped to the configured bounds. Transient discovery failures are retried
//! with exponential backoff before the request is failed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::{Jwk, JwkSet, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cache::{Clock, SystemClock};

/// Key store configuration
#[derive(Debug, Clone)]
pub struct KeyStoreConfig {
    /// Public OIDC discovery document URL
    pub discovery_url: String,
    /// Network-internal discovery URL, used for fetching when set
    pub discovery_internal_url: Option<String>,
    /// Timeout for each discovery or JWKS request (default: 5 seconds)
    pub request_timeout: Duration,
    /// Key set lifetime when the JWKS response has no max-age (default: 5 minutes)
    pub default_ttl: Duration,
    /// Lower bound on key set lifetime (default: 1 minute)
    pub min_ttl: Duration,
    /// Upper bound on key set lifetime (default: 24 hours)
    pub max_ttl: Duration,
    /// Retries after the first failed fetch (default: 3)
    pub max_retries: u32,
    /// First backoff delay, doubled per retry (default: 250ms)
    pub retry_base_delay: Duration,
    /// Backoff ceiling (default: 2 seconds)
    pub retry_max_delay: Duration,
    /// Minimum spacing of refreshes forced by an unknown key id (default: 30 seconds)
    pub min_refresh_interval: Duration,
}

impl KeyStoreConfig {
    pub fn new(discovery_url: impl Into<String>) -> Self {
        Self {
            discovery_url: discovery_url.into(),
            discovery_internal_url: None,
            request_timeout: Duration::from_secs(5),
            default_ttl: Duration::from_secs(300),
            min_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(86400),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(2),
            min_refresh_interval: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_internal_url(mut self, url: Option<String>) -> Self {
        self.discovery_internal_url = url;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_ttl_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_ttl = min;
        self.max_ttl = max;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    #[must_use]
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    fn fetch_url(&self) -> &str {
        self.discovery_internal_url
            .as_deref()
            .unwrap_or(&self.discovery_url)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}

/// Failure to obtain a usable key set
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyDiscoveryError {
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("{url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("malformed document from {url}: {message}")]
    Parse { url: String, message: String },

    #[error("no usable signing keys at {0}")]
    NoSigningKeys(String),

    #[error("HTTP client setup failed: {0}")]
    Client(String),
}

/// Observable key store lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStoreState {
    Uninitialized,
    Loaded,
    Expired,
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    jwks_uri: String,
}

/// A verification key from the provider's JWKS
#[derive(Clone)]
pub struct SigningKey {
    pub kid: Option<String>,
    pub algorithm: Option<Algorithm>,
    pub key: DecodingKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Currently trusted keys plus the issuer they belong to
#[derive(Debug)]
pub struct SigningKeySet {
    pub issuer: String,
    pub keys: Vec<SigningKey>,
    pub fetched_at: DateTime<Utc>,
    expires_at: Instant,
}

impl SigningKeySet {
    /// Keys that may have signed a token with the given header fields
    pub fn candidates(&self, kid: Option<&str>, alg: Algorithm) -> Vec<&SigningKey> {
        self.keys
            .iter()
            .filter(|k| k.algorithm.is_none_or(|a| a == alg))
            .filter(|k| match kid {
                Some(kid) => k.kid.as_deref() == Some(kid),
                None => true,
            })
            .collect()
    }
}

/// Outcome of the most recent refresh, kept under the refresh guard
#[derive(Debug, Default)]
struct RefreshState {
    last_success: Option<Instant>,
    last_failure: Option<KeyDiscoveryError>,
}

/// Shared, self-refreshing store of provider signing keys
pub struct KeyStore {
    config: KeyStoreConfig,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    current: RwLock<Option<Arc<SigningKeySet>>>,
    /// Serializes refreshes
    refresh_guard: Mutex<RefreshState>,
    /// Bumped under the guard each time a refresh finishes
    refresh_generation: AtomicU64,
}

impl KeyStore {
    pub fn new(config: KeyStoreConfig) -> Result<Self, KeyDiscoveryError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: KeyStoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, KeyDiscoveryError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| KeyDiscoveryError::Client(e.to_string()))?;

        Ok(Self {
            config,
            http,
            clock,
            current: RwLock::new(None),
            refresh_guard: Mutex::new(RefreshState::default()),
            refresh_generation: AtomicU64::new(0),
        })
    }

    pub async fn state(&self) -> KeyStoreState {
        match self.current.read().await.as_ref() {
            None => KeyStoreState::Uninitialized,
            Some(set) if self.is_expired(set) => KeyStoreState::Expired,
            Some(_) => KeyStoreState::Loaded,
        }
    }

    /// A live key set, fetching one if none is loaded or the current one expired
    pub async fn current(&self) -> Result<Arc<SigningKeySet>, KeyDiscoveryError> {
        if let Some(set) = self.current.read().await.as_ref()
            && !self.is_expired(set)
        {
            return Ok(set.clone());
        }
        self.refresh(None).await
    }

    /// Refresh after a token named a key id missing from `stale`
    ///
    /// Returns the newer set without fetching if another caller already
    /// replaced `stale`, and returns `stale` unchanged if the last refresh was
    /// too recent.
    pub async fn refresh_for_unknown_kid(
        &self,
        stale: &Arc<SigningKeySet>,
    ) -> Result<Arc<SigningKeySet>, KeyDiscoveryError> {
        self.refresh(Some(stale)).await
    }

    async fn refresh(
        &self,
        stale: Option<&Arc<SigningKeySet>>,
    ) -> Result<Arc<SigningKeySet>, KeyDiscoveryError> {
        let queued_at = self.refresh_generation.load(Ordering::Acquire);
        let mut refresh = self.refresh_guard.lock().await;

        // Whoever held the guard before us may already have done the work.
        if let Some(current) = self.current.read().await.clone()
            && !self.is_expired(&current)
        {
            match stale {
                None => return Ok(current),
                Some(stale) if !Arc::ptr_eq(stale, &current) => return Ok(current),
                Some(_) => {
                    let too_soon = refresh.last_success.is_some_and(|at| {
                        self.clock.now().duration_since(at) < self.config.min_refresh_interval
                    });
                    if too_soon {
                        debug!("Skipping key refresh for unknown kid, last refresh too recent");
                        return Ok(current);
                    }
                }
            }
        }

        // A refresh finished while we were queued and it failed.
        if self.refresh_generation.load(Ordering::Acquire) != queued_at
            && let Some(error) = &refresh.last_failure
        {
            debug!("Sharing failed key refresh with queued caller");
            return Err(error.clone());
        }

        let outcome = self.fetch_with_retry().await;
        self.refresh_generation.fetch_add(1, Ordering::AcqRel);
        match outcome {
            Ok(set) => {
                let fetched = Arc::new(set);
                let previous = self.current.write().await.replace(fetched.clone());
                if let Some(previous) = previous {
                    debug!("Replaced key set fetched at {}", previous.fetched_at.to_rfc3339());
                }
                refresh.last_success = Some(self.clock.now());
                refresh.last_failure = None;
                Ok(fetched)
            }
            Err(e) => {
                refresh.last_failure = Some(e.clone());
                Err(e)
            }
        }
    }

    fn is_expired(&self, set: &SigningKeySet) -> bool {
        self.clock.now() > set.expires_at
    }

    async fn fetch_with_retry(&self) -> Result<SigningKeySet, KeyDiscoveryError> {
        let mut attempt = 0;
        loop {
            match self.fetch().await {
                Ok(set) => return Ok(set),
                Err(e) if attempt < self.config.max_retries => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        "Key discovery failed (attempt {}), retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("Key discovery failed after {} attempts: {}", attempt + 1, e);
                    return Err(e);
                }
            }
        }
    }

    async fn fetch(&self) -> Result<SigningKeySet, KeyDiscoveryError> {
        let discovery_url = self.config.fetch_url();
        debug!("Fetching OIDC discovery document from {}", discovery_url);
        let (discovery, _) = self.get_json::<DiscoveryDocument>(discovery_url).await?;

        debug!("Fetching JWKS from {}", discovery.jwks_uri);
        let (jwks, headers) = self.get_json::<JwkSet>(&discovery.jwks_uri).await?;

        let keys: Vec<SigningKey> = jwks
            .keys
            .iter()
            .filter(|k| !matches!(k.common.public_key_use, Some(PublicKeyUse::Encryption)))
            .filter_map(|jwk| {
                DecodingKey::from_jwk(jwk).ok().map(|key| SigningKey {
                    kid: jwk.common.key_id.clone(),
                    algorithm: jwk_algorithm(jwk),
                    key,
                })
            })
            .collect();

        if keys.is_empty() {
            return Err(KeyDiscoveryError::NoSigningKeys(discovery.jwks_uri));
        }

        let ttl = self.ttl_from_headers(&headers);
        info!(
            "Loaded {} signing keys for issuer {}, valid for {:?}",
            keys.len(),
            discovery.issuer,
            ttl
        );

        Ok(SigningKeySet {
            issuer: discovery.issuer,
            keys,
            fetched_at: Utc::now(),
            expires_at: self.clock.now() + ttl,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<(T, reqwest::header::HeaderMap), KeyDiscoveryError> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| KeyDiscoveryError::Network {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(KeyDiscoveryError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let headers = response.headers().clone();
        let body = response.json::<T>().await.map_err(|e| KeyDiscoveryError::Parse {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok((body, headers))
    }

    fn ttl_from_headers(&self, headers: &reqwest::header::HeaderMap) -> Duration {
        headers
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.split(',').find_map(|directive| {
                    directive
                        .trim()
                        .strip_prefix("max-age=")
                        .and_then(|secs| secs.parse::<u64>().ok())
                })
            })
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_ttl)
            .clamp(self.config.min_ttl, self.config.max_ttl)
    }
}

fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    jwk.common.key_algorithm.as_ref().and_then(|alg| match alg {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    })
}
