//! Model schemas
//!
//! A schema is the ordered list of attribute fields a model carries on top of
//! the record columns every model has (`id`, `lsn`, `tenant_id`,
//! `created_at`, `updated_at`). It drives payload validation for create and
//! update and tells storage which unique indexes to build.

use chrono::DateTime;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::record::Attributes;

/// Record columns every model carries; field names may not shadow them
pub const RECORD_COLUMNS: &[&str] = &["id", "lsn", "tenant_id", "created_at", "updated_at"];

/// Attribute value types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Uuid,
    DateTime,
    Json,
    /// UUID of a record of another model, resolved by name at rebuild
    Reference(String),
}

impl FieldType {
    /// Whether values of this type can be ordered and used in a cursor
    pub fn is_sortable(&self) -> bool {
        !matches!(self, FieldType::Json | FieldType::Boolean)
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Uuid | FieldType::Reference(_) => value
                .as_str()
                .map(|s| Uuid::parse_str(s).is_ok())
                .unwrap_or(false),
            FieldType::DateTime => value
                .as_str()
                .map(|s| DateTime::parse_from_rfc3339(s).is_ok())
                .unwrap_or(false),
            FieldType::Json => true,
        }
    }
}

/// A single attribute field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl FieldDefinition {
    /// Create a new required field with the given name and type
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            nullable: false,
            unique: false,
            default: None,
            max_length: None,
            comment: None,
        }
    }

    /// Set whether the field accepts null
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Mark the field unique within a tenant
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Value applied on create when the payload omits the field
    pub fn default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// A field is required on create when it can be neither null nor defaulted
    pub fn is_required(&self) -> bool {
        !self.nullable && self.default.is_none()
    }

    fn validate_value(&self, model: &str, value: &Value) -> Result<()> {
        if value.is_null() {
            if self.nullable {
                return Ok(());
            }
            return Err(Error::Validation(format!(
                "{}.{} cannot be null",
                model, self.name
            )));
        }
        if !self.field_type.accepts(value) {
            return Err(Error::Validation(format!(
                "{}.{} expects {:?}, got {}",
                model, self.name, self.field_type, value
            )));
        }
        if let (Some(max), Some(s)) = (self.max_length, value.as_str()) {
            if s.chars().count() > max {
                return Err(Error::Validation(format!(
                    "{}.{} exceeds max length {}",
                    model, self.name, max
                )));
            }
        }
        Ok(())
    }
}

/// Ordered attribute fields of a model
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelSchema {
    fields: IndexMap<String, FieldDefinition>,
}

impl ModelSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field registration; a later field replaces an earlier
    /// one with the same name.
    pub fn field(mut self, field: FieldDefinition) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    pub fn from_fields(fields: impl IntoIterator<Item = FieldDefinition>) -> Self {
        fields.into_iter().fold(Self::new(), Self::field)
    }

    pub fn get(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.values()
    }

    pub fn unique_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.values().filter(|f| f.unique)
    }

    /// Fields whose type references another model
    pub fn references(&self) -> impl Iterator<Item = (&FieldDefinition, &str)> {
        self.fields.values().filter_map(|f| match &f.field_type {
            FieldType::Reference(target) => Some((f, target.as_str())),
            _ => None,
        })
    }

    /// Validate a create payload. Defaults must already be applied.
    pub fn validate_create(&self, model: &str, payload: &Attributes) -> Result<()> {
        self.reject_unknown(model, payload)?;
        for field in self.fields.values() {
            match payload.get(&field.name) {
                Some(value) => field.validate_value(model, value)?,
                None if field.nullable => {}
                None => {
                    return Err(Error::Validation(format!(
                        "{}.{} is required",
                        model, field.name
                    )))
                }
            }
        }
        Ok(())
    }

    /// Validate a partial update payload
    pub fn validate_update(&self, model: &str, payload: &Attributes) -> Result<()> {
        self.reject_unknown(model, payload)?;
        for (name, value) in payload {
            if let Some(field) = self.fields.get(name) {
                field.validate_value(model, value)?;
            }
        }
        Ok(())
    }

    fn reject_unknown(&self, model: &str, payload: &Attributes) -> Result<()> {
        if let Some(name) = payload.keys().find(|k| !self.fields.contains_key(*k)) {
            return Err(Error::Validation(format!(
                "{} has no field '{}'",
                model, name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product_schema() -> ModelSchema {
        ModelSchema::new()
            .field(FieldDefinition::new("name", FieldType::String).max_length(8))
            .field(FieldDefinition::new("price", FieldType::Float))
            .field(FieldDefinition::new("active", FieldType::Boolean).default(json!(true)))
            .field(FieldDefinition::new("note", FieldType::String).nullable(true))
    }

    fn attrs(value: Value) -> Attributes {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn create_requires_non_nullable_fields() {
        let schema = product_schema();

        let err = schema
            .validate_create("product", &attrs(json!({"name": "A", "active": true})))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("price")));

        schema
            .validate_create("product", &attrs(json!({"name": "A", "price": 10, "active": true})))
            .unwrap();
    }

    #[test]
    fn update_accepts_partial_payloads_but_not_unknown_fields() {
        let schema = product_schema();

        schema
            .validate_update("product", &attrs(json!({"price": 12.5})))
            .unwrap();
        assert!(schema
            .validate_update("product", &attrs(json!({"colour": "red"})))
            .is_err());
        assert!(schema
            .validate_update("product", &attrs(json!({"price": null})))
            .is_err());
        schema
            .validate_update("product", &attrs(json!({"note": null})))
            .unwrap();
    }

    #[test]
    fn type_and_length_checks() {
        let schema = product_schema();

        assert!(schema
            .validate_update("product", &attrs(json!({"price": "ten"})))
            .is_err());
        assert!(schema
            .validate_update("product", &attrs(json!({"name": "much too long"})))
            .is_err());
        assert!(!FieldType::Json.is_sortable());
        assert!(FieldType::DateTime.accepts(&json!("2024-05-01T10:00:00Z")));
    }
}
