//! # STAC Auth Proxy
//!
//! Reverse proxy that puts authentication, route-level authorization and
//! record-level CQL2 filtering in front of a STAC API that knows nothing
//! about any of them.
//!
//! Every request passes through auth enforcement, filter build and filter
//! apply before reaching the upstream; single-record reads are checked again
//! on the way back.

pub mod cache;
pub mod config;
pub mod error;
pub mod filters;
pub mod openapi;
pub mod pipeline;
pub mod proxy;
pub mod routes;
pub mod security;
pub mod server;

// Re-export commonly used types
pub use config::{ConfigError, ProxyConfig};
pub use error::ProxyError;
pub use filters::{FilterExpression, FilterFactory, FilterRegistry, RequestContext};
pub use server::ProxyServer;

/// Current version of the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
