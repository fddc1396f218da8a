//! Naming utilities
//!
//! Model keys, resource paths and storage identifiers are derived here so
//! every component agrees on them.

use inflector::Inflector;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z_][a-z0-9_]*$").expect("identifier pattern is valid")
});

/// Registry key of a model: snake_case of the declared name
pub fn model_key(name: &str) -> String {
    name.to_snake_case()
}

/// Default URL path segment of a model
pub fn resource_name(model_name: &str) -> String {
    let name = model_key(model_name);

    // Irregular plurals the inflector gets wrong
    match name.as_str() {
        "person" => "people".to_string(),
        "child" => "children".to_string(),
        _ => name.to_plural(),
    }
}

/// Whether `name` can be embedded in SQL text and JSON paths unquoted
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Fail with `ConfigurationError` unless `name` is a plain identifier
pub fn require_identifier(kind: &str, name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(Error::ConfigurationError(format!(
            "{} name '{}' must match [a-z_][a-z0-9_]*",
            kind, name
        )))
    }
}

/// Name of the unique index backing a unique field
pub fn unique_index_name(model_key: &str, field: &str) -> String {
    format!("ux_records_{}_{}", model_key, field)
}
