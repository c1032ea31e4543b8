//! Template engine
//!
//! Thin wrapper around minijinja configured for manifest output:
//! - Strict undefined behaviour, so a missing field is an error rather than
//!   an empty string in the rendered YAML
//! - No auto-escaping regardless of template name
//! - Trailing newlines preserved so output is byte-stable

use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde::Serialize;

use super::error::TemplateError;

/// Template engine holding a set of named, pre-parsed templates
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create an engine with no templates registered
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_keep_trailing_newline(true);
        Self { env }
    }

    /// Parse and register a template under `name`
    ///
    /// # Errors
    ///
    /// Returns `TemplateError::Syntax` if the template does not parse.
    pub fn add_template(
        &mut self,
        name: &'static str,
        source: &'static str,
    ) -> Result<(), TemplateError> {
        self.env.add_template(name, source).map_err(TemplateError::from)
    }

    /// Render a registered template with the given context
    ///
    /// # Errors
    ///
    /// Returns `TemplateError` if the template is unknown, references an
    /// undefined variable, or fails during evaluation.
    pub fn render<S: Serialize>(&self, name: &str, ctx: S) -> Result<String, TemplateError> {
        let template = self.env.get_template(name)?;
        Ok(template.render(ctx)?)
    }
}
