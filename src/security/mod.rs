//! Bearer token validation and route-level access control

pub mod auth;
pub mod enforce;
pub mod jwks;

pub use auth::{AuthClaims, TokenError, TokenValidator, TokenValidatorConfig};
pub use enforce::{AuthPolicy, AuthState, Requirement, enforce_auth};
pub use jwks::{KeyStore, KeyStoreConfig};
