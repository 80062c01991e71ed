//! Template-rendered filters
//!
//! Renders a minijinja template against the request context (`req` and
//! `payload`) and parses the output as CQL2 text. Deterministic, no I/O.

use std::sync::Arc;

use async_trait::async_trait;
use minijinja::Environment;
use tracing::trace;

use super::{FilterError, FilterExpression, FilterFactory, RequestContext, string_arg};
use crate::config::{ConfigError, FilterConfig};

pub struct TemplateFilter {
    env: Environment<'static>,
    source: String,
}

impl TemplateFilter {
    /// Fails if `source` is not a syntactically valid template
    pub fn new(source: impl Into<String>) -> Result<Self, ConfigError> {
        let source = source.into();
        let env = Environment::new();
        env.template_from_str(&source)
            .map_err(|e| ConfigError::InvalidTemplate(e.to_string()))?;
        Ok(Self { env, source })
    }

    /// Template source is the first positional argument or the `template` keyword
    pub fn from_config(config: &FilterConfig) -> Result<Arc<dyn FilterFactory>, ConfigError> {
        let source = string_arg(config, 0, "template")?;
        Ok(Arc::new(Self::new(source)?))
    }

    pub fn render(&self, ctx: &RequestContext) -> Result<String, FilterError> {
        let rendered = self
            .env
            .render_str(&self.source, ctx)
            .map_err(|e| FilterError::Render(e.to_string()))?;
        Ok(rendered.trim().to_string())
    }
}

#[async_trait]
impl FilterFactory for TemplateFilter {
    async fn generate(&self, ctx: &RequestContext) -> Result<FilterExpression, FilterError> {
        let rendered = self.render(ctx)?;
        trace!("Template rendered filter: {}", rendered);
        if rendered.is_empty() {
            return Err(FilterError::InvalidOutput("template rendered nothing".into()));
        }
        Ok(FilterExpression::parse(&rendered)?)
    }
}
