//! Extension points of the local manager

use serde_json::Value;

use crate::auth::RequestContext;
use crate::error::Error;
use crate::models::record::{Attributes, Record};
use crate::models::registry::ModelInfo;
use crate::utils::naming::unique_index_name;

/// Per-model customisation of the local manager.
///
/// Every method has a default, so implementations override only what they
/// need. Hooks run inside the request, before the storage transaction
/// commits; an error aborts the operation.
pub trait ManagerHooks: Send + Sync {
    /// Adjust a create payload before validation. The default applies schema
    /// defaults for omitted fields.
    fn prepare_create(
        &self,
        info: &ModelInfo,
        _context: &RequestContext,
        payload: &mut Attributes,
    ) -> crate::Result<()> {
        apply_defaults(info, payload);
        Ok(())
    }

    /// Adjust an update payload; `current` is the stored record
    fn prepare_update(
        &self,
        _info: &ModelInfo,
        _context: &RequestContext,
        _current: &Record,
        _payload: &mut Attributes,
    ) -> crate::Result<()> {
        Ok(())
    }

    /// Veto a delete by returning an error
    fn prepare_delete(
        &self,
        _info: &ModelInfo,
        _context: &RequestContext,
        _current: &Record,
    ) -> crate::Result<()> {
        Ok(())
    }

    /// Turn a storage failure of a write into a domain error
    fn translate_integrity_error(&self, info: &ModelInfo, error: sqlx::Error) -> Error {
        translate_integrity_error(info, error)
    }
}

/// Hooks used when a model registers none
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl ManagerHooks for DefaultHooks {}

/// Fill omitted fields from their schema defaults
pub fn apply_defaults(info: &ModelInfo, payload: &mut Attributes) {
    for field in info.schema.fields() {
        if let Some(default) = &field.default {
            payload
                .entry(field.name.clone())
                .or_insert_with(|| default.clone());
        }
    }
}

/// Default translation: unique violations become `Duplicate`, other
/// constraint violations `Validation`, anything else stays a database error.
pub fn translate_integrity_error(info: &ModelInfo, error: sqlx::Error) -> Error {
    let db_error = match &error {
        sqlx::Error::Database(db_error) => db_error,
        _ => return Error::Database(error),
    };

    if db_error.is_unique_violation() {
        let message = db_error.message();
        let field = info
            .schema
            .unique_fields()
            .find(|f| message.contains(&unique_index_name(&info.name, &f.name)))
            .map(|f| f.name.clone());
        return match field {
            Some(field) => Error::Duplicate(format!(
                "{}.{} must be unique within the tenant",
                info.name, field
            )),
            None => Error::Duplicate(format!("{} already exists", info.name)),
        };
    }
    if db_error.is_check_violation() || db_error.is_foreign_key_violation() {
        return Error::Validation(db_error.message().to_string());
    }
    Error::Database(error)
}

/// Whether a payload value would change the stored attribute
pub(crate) fn changes(current: &Attributes, field: &str, value: &Value) -> bool {
    match current.get(field) {
        Some(existing) => existing != value,
        None => !value.is_null(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::filter::FilterSpec;
    use crate::models::registry::ModelRegistry;
    use crate::models::schema::{FieldDefinition, FieldType, ModelSchema};
    use serde_json::json;

    #[test]
    fn defaults_fill_only_missing_fields() {
        let mut registry = ModelRegistry::new();
        registry
            .register_local(
                "Product",
                None,
                ModelSchema::new()
                    .field(FieldDefinition::new("active", FieldType::Boolean).default(json!(true)))
                    .field(FieldDefinition::new("stock", FieldType::Integer).default(json!(0))),
                FilterSpec::default(),
            )
            .unwrap();
        registry.rebuild().unwrap();
        let info = registry.get_model_info("product").unwrap();

        let mut payload = json!({"stock": 7}).as_object().cloned().unwrap();
        apply_defaults(&info, &mut payload);

        assert_eq!(payload["active"], json!(true));
        assert_eq!(payload["stock"], json!(7));
    }

    #[test]
    fn non_database_errors_pass_through() {
        let info = {
            let mut registry = ModelRegistry::new();
            registry
                .register_local("Tag", None, ModelSchema::new(), FilterSpec::default())
                .unwrap();
            registry.rebuild().unwrap();
            registry.get_model_info("tag").unwrap()
        };

        assert!(matches!(
            translate_integrity_error(&info, sqlx::Error::RowNotFound),
            Error::Database(_)
        ));
    }

    #[test]
    fn absent_and_null_are_the_same_value() {
        let current = json!({"name": "A"}).as_object().cloned().unwrap();

        assert!(!changes(&current, "name", &json!("A")));
        assert!(changes(&current, "name", &json!("B")));
        assert!(!changes(&current, "note", &Value::Null));
    }
}
