//! Schema validation of raw provider output.
//!
//! Providers answer with untyped JSON. Validation is two steps: serde
//! deserialization into the stage's payload type, then the payload's own
//! semantic checks via [`Validate`].

use serde::de::DeserializeOwned;
use std::fmt;

/// A schema violation found while validating provider output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// Error message.
    pub message: String,
    /// Field that caused the error, if applicable.
    pub field: Option<String>,
}

impl SchemaViolation {
    /// Creates a new violation.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    /// Creates a violation for a specific field.
    #[must_use]
    pub fn for_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref field) = self.field {
            write!(f, "Field '{}': {}", field, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for SchemaViolation {}

/// Semantic checks applied after deserialization.
pub trait Validate {
    /// Checks the payload, returning the first violation found.
    fn validate(&self) -> Result<(), SchemaViolation>;
}

/// Deserializes and validates a payload from raw provider output.
pub fn parse<T>(raw: serde_json::Value) -> Result<T, SchemaViolation>
where
    T: DeserializeOwned + Validate,
{
    let payload: T = serde_json::from_value(raw).map_err(|e| SchemaViolation::new(e.to_string()))?;
    payload.validate()?;
    Ok(payload)
}

/// Checks that a string field is not blank.
pub fn require_text(field: &str, value: &str) -> Result<(), SchemaViolation> {
    if value.trim().is_empty() {
        return Err(SchemaViolation::for_field(field, "must not be empty"));
    }
    Ok(())
}

/// Checks that a list field is not empty.
pub fn require_items<T>(field: &str, items: &[T]) -> Result<(), SchemaViolation> {
    if items.is_empty() {
        return Err(SchemaViolation::for_field(field, "must contain at least one item"));
    }
    Ok(())
}

/// Checks that a color is written as `#rrggbb`.
pub fn require_hex_color(field: &str, value: &str) -> Result<(), SchemaViolation> {
    let valid = value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(SchemaViolation::for_field(
            field,
            format!("'{value}' is not a #rrggbb color"),
        ));
    }
    Ok(())
}

/// Checks that a path is relative and stays below its root.
pub fn require_relative_path(field: &str, value: &str) -> Result<(), SchemaViolation> {
    require_text(field, value)?;
    let path = std::path::Path::new(value);
    let escapes = path.components().any(|c| {
        !matches!(
            c,
            std::path::Component::Normal(_) | std::path::Component::CurDir
        )
    });
    if path.is_absolute() || escapes || value.starts_with('/') || value.starts_with('\\') {
        return Err(SchemaViolation::for_field(
            field,
            format!("'{value}' must be a relative path without '..'"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Named {
        name: String,
    }

    impl Validate for Named {
        fn validate(&self) -> Result<(), SchemaViolation> {
            require_text("name", &self.name)
        }
    }

    #[test]
    fn test_parse_valid() {
        let named: Named = parse(serde_json::json!({"name": "home"})).unwrap();
        assert_eq!(named.name, "home");
    }

    #[test]
    fn test_parse_missing_field() {
        let err = parse::<Named>(serde_json::json!({"title": "home"})).unwrap_err();
        assert!(err.message.contains("name"));
    }

    #[test]
    fn test_parse_semantic_failure() {
        let err = parse::<Named>(serde_json::json!({"name": "  "})).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("name"));
        assert_eq!(err.to_string(), "Field 'name': must not be empty");
    }

    #[test]
    fn test_hex_color() {
        assert!(require_hex_color("c", "#1a2B3c").is_ok());
        assert!(require_hex_color("c", "1a2b3c").is_err());
        assert!(require_hex_color("c", "#12345").is_err());
        assert!(require_hex_color("c", "#12345g").is_err());
    }

    #[test]
    fn test_relative_path() {
        assert!(require_relative_path("p", "index.html").is_ok());
        assert!(require_relative_path("p", "assets/css/site.css").is_ok());
        assert!(require_relative_path("p", "./about.html").is_ok());
        assert!(require_relative_path("p", "/etc/passwd").is_err());
        assert!(require_relative_path("p", "../secret").is_err());
        assert!(require_relative_path("p", "a/../../b").is_err());
        assert!(require_relative_path("p", "").is_err());
    }
}
