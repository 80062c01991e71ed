use std::sync::Arc;

use axum::http::{HeaderMap, header};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, TokenData, Validation, decode, decode_header};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::jwks::{KeyDiscoveryError, KeyStore, SigningKeySet};

/// Reasons a bearer token is rejected
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    TokenInvalid(String),

    #[error("token has expired")]
    TokenExpired,

    #[error("token audience is not accepted")]
    TokenAudienceMismatch,

    #[error("signing keys unavailable: {0}")]
    KeyDiscoveryFailed(String),
}

impl From<KeyDiscoveryError> for TokenError {
    fn from(err: KeyDiscoveryError) -> Self {
        Self::KeyDiscoveryFailed(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct TokenValidatorConfig {
    /// Accepted signing algorithms (default: RS256)
    pub algorithms: Vec<Algorithm>,
    /// Accepted audiences; empty disables the audience check
    pub audiences: Vec<String>,
    /// Clock skew tolerance in seconds for exp/nbf
    pub leeway: u64,
}

impl Default for TokenValidatorConfig {
    fn default() -> Self {
        Self {
            algorithms: vec![Algorithm::RS256],
            audiences: Vec::new(),
            leeway: 0,
        }
    }
}

/// Verified token payload
#[derive(Debug, Clone, Serialize)]
pub struct AuthClaims {
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub scopes: Vec<String>,
    /// Every claim in the token, including the ones above
    pub claims: Map<String, Value>,
}

impl AuthClaims {
    pub fn from_claims(claims: Map<String, Value>) -> Self {
        let text = |name: &str| claims.get(name).and_then(Value::as_str).map(str::to_string);
        Self {
            subject: text("sub"),
            issuer: text("iss"),
            scopes: scopes_from_claims(&claims),
            claims,
        }
    }

    /// Whether the token carries every scope in `required`
    pub fn has_scopes(&self, required: &[String]) -> bool {
        required.iter().all(|scope| self.scopes.contains(scope))
    }
}

/// Scopes from `scope` (space separated) or `scp` (array or string)
fn scopes_from_claims(claims: &Map<String, Value>) -> Vec<String> {
    let raw = claims.get("scope").or_else(|| claims.get("scp"));
    match raw {
        Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Bearer token from the `Authorization` header, if well-formed
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Verifies bearer tokens against the provider's signing keys
pub struct TokenValidator {
    keys: Arc<KeyStore>,
    config: TokenValidatorConfig,
}

impl TokenValidator {
    pub fn new(keys: Arc<KeyStore>, config: TokenValidatorConfig) -> Self {
        Self { keys, config }
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    /// Verify signature, issuer, audience and expiry, returning the claims
    pub async fn validate(&self, token: &str) -> Result<AuthClaims, TokenError> {
        let header =
            decode_header(token).map_err(|e| TokenError::TokenInvalid(e.to_string()))?;

        if !self.config.algorithms.contains(&header.alg) {
            return Err(TokenError::TokenInvalid(format!(
                "algorithm {:?} is not accepted",
                header.alg
            )));
        }

        let mut key_set = self.keys.current().await?;
        let kid = header.kid.as_deref();

        if kid.is_some() && key_set.candidates(kid, header.alg).is_empty() {
            debug!("Token names an unknown key id, refreshing signing keys");
            key_set = self.keys.refresh_for_unknown_kid(&key_set).await?;
        }

        let data = self.decode_with(&key_set, token, kid, header.alg)?;
        Ok(AuthClaims::from_claims(data.claims))
    }

    fn decode_with(
        &self,
        key_set: &SigningKeySet,
        token: &str,
        kid: Option<&str>,
        alg: Algorithm,
    ) -> Result<TokenData<Map<String, Value>>, TokenError> {
        let candidates = key_set.candidates(kid, alg);
        if candidates.is_empty() {
            return Err(TokenError::TokenInvalid("no matching signing key".into()));
        }

        let mut validation = Validation::new(alg);
        validation.leeway = self.config.leeway;
        validation.set_issuer(&[&key_set.issuer]);
        if self.config.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.config.audiences);
        }

        let mut last_error = None;
        for candidate in candidates {
            match decode::<Map<String, Value>>(token, &candidate.key, &validation) {
                Ok(data) => return Ok(data),
                Err(e) => match e.kind() {
                    ErrorKind::ExpiredSignature => return Err(TokenError::TokenExpired),
                    ErrorKind::InvalidAudience => return Err(TokenError::TokenAudienceMismatch),
                    _ => last_error = Some(e),
                },
            }
        }

        let message = last_error.map_or_else(|| "verification failed".to_string(), |e| e.to_string());
        warn!("Token verification failed: {}", message);
        Err(TokenError::TokenInvalid(message))
    }
}
