//! Route-level authentication and authorization
//!
//! [`AuthPolicy`] decides, from the private and public endpoint tables and the
//! default policy, whether a request needs a token and which scopes it must
//! carry. [`enforce_auth`] applies that decision to each request and, on
//! success, leaves the verified [`AuthClaims`] in the request extensions for
//! later stages.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use tracing::{debug, warn};

use super::auth::{AuthClaims, TokenValidator, extract_bearer_token};
use crate::config::EndpointMethods;
use crate::error::ProxyError;
use crate::routes::{MatchMode, RouteError, RouteTable};

/// Methods reported by capability checks
pub const STANDARD_METHODS: [Method; 5] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Private,
    Public,
}

/// What a request must present to proceed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Anonymous,
    Token { scopes: Vec<String> },
}

impl Requirement {
    pub fn is_private(&self) -> bool {
        matches!(self, Self::Token { .. })
    }

    /// Whether `claims` (or their absence) satisfy this requirement
    pub fn admits(&self, claims: Option<&AuthClaims>) -> bool {
        match self {
            Self::Anonymous => true,
            Self::Token { scopes } => claims.is_some_and(|c| c.has_scopes(scopes)),
        }
    }
}

/// Authorization table plus default policy
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    table: RouteTable<Access>,
    default_public: bool,
}

impl AuthPolicy {
    /// Private rules are consulted before public ones
    pub fn from_tables(
        mode: MatchMode,
        private: &EndpointMethods,
        public: &EndpointMethods,
        default_public: bool,
    ) -> Result<Self, RouteError> {
        let mut table = RouteTable::new(mode);
        for (access, endpoints) in [(Access::Private, private), (Access::Public, public)] {
            for (pattern, methods) in endpoints {
                let rules = methods
                    .iter()
                    .map(|m| m.to_rule())
                    .collect::<Result<Vec<_>, _>>()?;
                table.push(pattern, rules, access)?;
            }
        }
        Ok(Self {
            table,
            default_public,
        })
    }

    pub fn default_public(&self) -> bool {
        self.default_public
    }

    pub fn decide(&self, path: &str, method: &Method) -> Requirement {
        match self.table.find(path, method) {
            Some(found) if *found.meta == Access::Private => Requirement::Token {
                scopes: found.scopes.to_vec(),
            },
            Some(_) => Requirement::Anonymous,
            None if self.default_public => Requirement::Anonymous,
            None => Requirement::Token { scopes: Vec::new() },
        }
    }

    /// Standard methods on `path` the caller may invoke
    pub fn allowed_methods(&self, path: &str, claims: Option<&AuthClaims>) -> Vec<Method> {
        STANDARD_METHODS
            .iter()
            .filter(|method| self.decide(path, method).admits(claims))
            .cloned()
            .collect()
    }
}

/// State for [`enforce_auth`]
#[derive(Clone)]
pub struct AuthState {
    pub policy: Arc<AuthPolicy>,
    pub validator: Arc<TokenValidator>,
}

/// Admit, reject, or pass through a request according to the auth policy
pub async fn enforce_auth(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    let path = request.uri().path().to_string();
    let method = request.method().clone();

    // OPTIONS is answered by the CORS layer or the capability responder.
    let requirement = if method == Method::OPTIONS {
        Requirement::Anonymous
    } else {
        state.policy.decide(&path, &method)
    };

    let claims = match (&requirement, extract_bearer_token(request.headers())) {
        (Requirement::Token { .. }, None) => {
            warn!("Rejecting {} {}: missing bearer token", method, path);
            return Err(ProxyError::Unauthorized("missing bearer token".into()));
        }
        (Requirement::Token { scopes }, Some(token)) => {
            let claims = state.validator.validate(token).await.inspect_err(|e| {
                warn!("Rejecting {} {}: {}", method, path, e);
            })?;
            if !claims.has_scopes(scopes) {
                warn!(
                    "Rejecting {} {}: token lacks required scopes {:?}",
                    method, path, scopes
                );
                return Err(ProxyError::Forbidden("insufficient scope".into()));
            }
            Some(claims)
        }
        (Requirement::Anonymous, _) => None,
    };

    if let Some(claims) = claims {
        debug!(
            "Authenticated {} {} as {}",
            method,
            path,
            claims.subject.as_deref().unwrap_or("<no subject>")
        );
        request.extensions_mut().insert(claims);
    }

    Ok(next.run(request).await)
}
