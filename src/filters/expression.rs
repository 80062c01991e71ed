//! CQL2 filter expressions
//!
//! Thin wrapper over [`cql2::Expr`] exposing exactly what the pipeline needs:
//! parsing from text or JSON, validation, serialization to either form,
//! evaluation against a record, and conjunction.

use std::fmt;

use cql2::Expr;
use serde_json::{Value, json};
use tracing::debug;

/// Error produced while handling a filter expression
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("failed to parse CQL2 expression: {0}")]
    Parse(String),

    #[error("CQL2 expression is not valid")]
    Invalid,

    #[error("failed to serialize CQL2 expression: {0}")]
    Serialize(String),
}

/// A parsed CQL2 expression
#[derive(Debug, Clone)]
pub struct FilterExpression(Expr);

impl FilterExpression {
    /// Parse CQL2 text, or CQL2 JSON when the input is a JSON object
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        let input = input.trim();
        let parsed = if input.starts_with('{') {
            cql2::parse_json(input).map_err(|e| e.to_string())
        } else {
            cql2::parse_text(input).map_err(|e| e.to_string())
        };
        parsed.map(Self).map_err(ExpressionError::Parse)
    }

    /// Build from a JSON value: strings are parsed as text, anything else as CQL2 JSON
    pub fn from_value(value: &Value) -> Result<Self, ExpressionError> {
        match value {
            Value::String(text) => Self::parse(text),
            other => serde_json::from_value::<Expr>(other.clone())
                .map(Self)
                .map_err(|e| ExpressionError::Parse(e.to_string())),
        }
    }

    /// Expression that admits every record
    pub fn always() -> Self {
        Self(Expr::Bool(true))
    }

    /// Structural validation against the CQL2 JSON schema
    pub fn validate(&self) -> Result<(), ExpressionError> {
        if self.0.is_valid() {
            Ok(())
        } else {
            Err(ExpressionError::Invalid)
        }
    }

    pub fn to_text(&self) -> Result<String, ExpressionError> {
        self.0
            .to_text()
            .map_err(|e| ExpressionError::Serialize(e.to_string()))
    }

    pub fn to_value(&self) -> Result<Value, ExpressionError> {
        serde_json::to_value(&self.0).map_err(|e| ExpressionError::Serialize(e.to_string()))
    }

    /// Whether `record` satisfies the expression
    ///
    /// Evaluation errors (missing properties, type mismatches) count as a
    /// non-match.
    pub fn matches(&self, record: &Value) -> bool {
        match self.0.clone().matches(Some(record)) {
            Ok(matched) => matched,
            Err(e) => {
                debug!("CQL2 evaluation failed, treating as non-match: {}", e);
                false
            }
        }
    }

    /// Logical AND of `self` and `other`
    pub fn and(&self, other: &FilterExpression) -> Result<Self, ExpressionError> {
        let combined = json!({
            "op": "and",
            "args": [self.to_value()?, other.to_value()?],
        });
        Self::from_value(&combined)
    }
}

impl fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str("<unprintable CQL2 expression>"),
        }
    }
}

impl From<Expr> for FilterExpression {
    fn from(expr: Expr) -> Self {
        Self(expr)
    }
}
