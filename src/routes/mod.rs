//! Regex route tables
//!
//! A [`RouteTable`] maps path patterns to the methods permitted on them, with
//! an optional scope requirement per method and an arbitrary payload per rule.
//! Rules are evaluated in insertion order against the raw request path and
//! the first rule whose pattern and method both match wins.

use std::collections::HashMap;

use axum::http::Method;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Error raised while building a route table
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("invalid route pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid HTTP method {0:?}")]
    InvalidMethod(String),
}

/// How much of the path a pattern must cover
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Pattern is anchored at the start of the path only
    #[default]
    Prefix,
    /// Pattern must match the whole path
    Full,
}

/// One permitted method on a rule, with the scopes it demands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRule {
    pub method: Method,
    pub scopes: Vec<String>,
}

impl MethodRule {
    pub fn new(method: &str, scopes: Vec<String>) -> Result<Self, RouteError> {
        let method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| RouteError::InvalidMethod(method.to_string()))?;
        Ok(Self { method, scopes })
    }
}

#[derive(Debug, Clone)]
struct RouteRule<T> {
    source: String,
    pattern: Regex,
    methods: Vec<MethodRule>,
    meta: T,
}

/// Result of a successful lookup
#[derive(Debug, Clone)]
pub struct RouteMatch<'a, T> {
    /// Source text of the matching pattern
    pub pattern: &'a str,
    /// Scopes required for the matched method (empty when none)
    pub scopes: &'a [String],
    /// Capture groups of the pattern; named groups by name, others by index
    pub params: HashMap<String, String>,
    /// Payload attached to the rule
    pub meta: &'a T,
}

/// Ordered, immutable-after-startup table of route rules
#[derive(Debug, Clone)]
pub struct RouteTable<T> {
    mode: MatchMode,
    rules: Vec<RouteRule<T>>,
}

impl<T> RouteTable<T> {
    pub fn new(mode: MatchMode) -> Self {
        Self {
            mode,
            rules: Vec::new(),
        }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Append a rule, compiling its pattern under the table's match mode
    pub fn push(
        &mut self,
        pattern: &str,
        methods: Vec<MethodRule>,
        meta: T,
    ) -> Result<(), RouteError> {
        let anchored = match self.mode {
            MatchMode::Prefix => format!("^(?:{})", pattern),
            MatchMode::Full => format!("^(?:{})$", pattern),
        };
        let compiled = Regex::new(&anchored).map_err(|source| RouteError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;

        self.rules.push(RouteRule {
            source: pattern.to_string(),
            pattern: compiled,
            methods,
            meta,
        });
        Ok(())
    }

    /// Builder-style variant of [`RouteTable::push`]
    pub fn with_rule(
        mut self,
        pattern: &str,
        methods: Vec<MethodRule>,
        meta: T,
    ) -> Result<Self, RouteError> {
        self.push(pattern, methods, meta)?;
        Ok(self)
    }

    /// First rule matching both `path` and `method`
    pub fn find(&self, path: &str, method: &Method) -> Option<RouteMatch<'_, T>> {
        self.rules.iter().find_map(|rule| {
            let method_rule = rule.methods.iter().find(|m| &m.method == method)?;
            let captures = rule.pattern.captures(path)?;

            let mut params = HashMap::new();
            for (index, name) in rule.pattern.capture_names().enumerate().skip(1) {
                if let Some(value) = captures.get(index) {
                    let key = name.map_or_else(|| index.to_string(), str::to_string);
                    params.insert(key, value.as_str().to_string());
                }
            }

            Some(RouteMatch {
                pattern: &rule.source,
                scopes: &method_rule.scopes,
                params,
                meta: &rule.meta,
            })
        })
    }

    /// Whether any rule pattern matches `path`, ignoring methods
    pub fn matches_path(&self, path: &str) -> bool {
        self.rules.iter().any(|rule| rule.pattern.is_match(path))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
