//! Template error types

use std::fmt;

use minijinja::ErrorKind;

/// Errors that can occur during manifest rendering
#[derive(Debug)]
pub enum TemplateError {
    /// Template rendering failed
    Render(minijinja::Error),
    /// Template syntax is invalid
    Syntax(String),
    /// A referenced variable is undefined
    Undefined(String),
    /// No template is registered under this name
    UnknownTemplate(String),
    /// A context field is missing or invalid
    InvalidField {
        /// Context field name
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },
}

impl TemplateError {
    /// Create an invalid field error
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Render(e) => write!(f, "template render error: {}", e),
            Self::Syntax(msg) => write!(f, "template syntax error: {}", msg),
            Self::Undefined(msg) => write!(f, "undefined variable: {}", msg),
            Self::UnknownTemplate(name) => write!(f, "unknown template: {}", name),
            Self::InvalidField { field, reason } => {
                write!(f, "invalid field '{}': {}", field, reason)
            }
        }
    }
}

impl std::error::Error for TemplateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Render(e) => Some(e),
            _ => None,
        }
    }
}

impl From<minijinja::Error> for TemplateError {
    fn from(err: minijinja::Error) -> Self {
        match err.kind() {
            ErrorKind::SyntaxError => Self::Syntax(err.to_string()),
            ErrorKind::UndefinedError => Self::Undefined(err.to_string()),
            ErrorKind::TemplateNotFound => Self::UnknownTemplate(err.to_string()),
            _ => Self::Render(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_field_display() {
        let err = TemplateError::invalid_field("image", "must not be empty");
        assert_eq!(err.to_string(), "invalid field 'image': must not be empty");
    }

    #[test]
    fn test_syntax_errors_are_classified() {
        let err: TemplateError =
            minijinja::Error::new(ErrorKind::SyntaxError, "unexpected end of input").into();
        assert!(matches!(err, TemplateError::Syntax(_)));
        assert!(err.to_string().contains("syntax error"));
    }

    #[test]
    fn test_other_minijinja_errors_keep_their_source() {
        let err: TemplateError =
            minijinja::Error::new(ErrorKind::InvalidOperation, "nope").into();
        assert!(matches!(err, TemplateError::Render(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
