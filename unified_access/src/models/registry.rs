//! Model registry
//!
//! Maps model names to everything needed to build a manager for them. The
//! registry has an explicit lifecycle: models are registered while it is
//! being built, [`ModelRegistry::rebuild`] resolves cross-model references
//! once, and from then on it is read-only (typically shared through an
//! `Arc`). Lookups before the rebuild fail, as do registrations after it.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{ModelAccessConfig, ModelConfig};
use crate::data_access::hooks::ManagerHooks;
use crate::error::{Error, Result};
use crate::models::filter::{FilterSpec, RESERVED_PARAMS};
use crate::models::schema::{ModelSchema, RECORD_COLUMNS};
use crate::utils::naming::{model_key, require_identifier, resource_name};

/// Body keys with a meaning of their own in update requests
const RESERVED_FIELDS: &[&str] = &["expected_lsn"];

/// How outbound calls to a remote service are authenticated
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum AuthStrategy {
    /// Forward the caller's bearer credential
    #[default]
    Forward,
    /// Use a fixed service credential
    ServiceToken { token: String },
    /// Send no credential
    None,
}

/// Where a remote model lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    /// Service identifier, used in logs and errors
    pub service: String,
    #[serde(default)]
    pub auth: AuthStrategy,
}

impl RemoteConfig {
    pub fn new(base_url: &str, service: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service: service.to_string(),
            auth: AuthStrategy::Forward,
        }
    }

    pub fn auth(mut self, auth: AuthStrategy) -> Self {
        self.auth = auth;
        self
    }
}

/// Execution strategy of a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessMode {
    Local,
    Remote(RemoteConfig),
}

/// A reference field resolved at rebuild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub field: String,
    /// Registry key of the referenced model
    pub target: String,
    /// Whether the referenced model is stored by this service
    pub target_is_local: bool,
}

/// Everything the registry knows about one model
#[derive(Clone)]
pub struct ModelInfo {
    pub name: String,
    pub resource: String,
    pub schema: ModelSchema,
    pub filter: FilterSpec,
    pub access: AccessMode,
    /// Custom local manager behaviour; `None` uses the default hooks
    pub hooks: Option<Arc<dyn ManagerHooks>>,
    /// Filled in by rebuild
    pub relations: Vec<Relation>,
}

impl fmt::Debug for ModelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelInfo")
            .field("name", &self.name)
            .field("resource", &self.resource)
            .field("access", &self.access)
            .field("custom_hooks", &self.hooks.is_some())
            .field("relations", &self.relations)
            .finish()
    }
}

impl ModelInfo {
    pub fn is_local(&self) -> bool {
        matches!(self.access, AccessMode::Local)
    }

    fn same_definition(&self, other: &ModelInfo) -> bool {
        let same_hooks = match (&self.hooks, &other.hooks) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        same_hooks
            && self.resource == other.resource
            && self.schema == other.schema
            && self.filter == other.filter
            && self.access == other.access
    }
}

/// Builder for a registry entry
pub struct ModelDefinition {
    info: ModelInfo,
}

impl ModelDefinition {
    pub fn local(name: &str, schema: ModelSchema) -> Self {
        Self::with_access(name, schema, AccessMode::Local)
    }

    pub fn remote(name: &str, config: RemoteConfig, schema: ModelSchema) -> Self {
        Self::with_access(name, schema, AccessMode::Remote(config))
    }

    fn with_access(name: &str, schema: ModelSchema, access: AccessMode) -> Self {
        Self {
            info: ModelInfo {
                name: model_key(name),
                resource: resource_name(name),
                schema,
                filter: FilterSpec::default(),
                access,
                hooks: None,
                relations: Vec::new(),
            },
        }
    }

    pub fn filter(mut self, filter: FilterSpec) -> Self {
        self.info.filter = filter;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn ManagerHooks>) -> Self {
        self.info.hooks = Some(hooks);
        self
    }

    pub fn resource(mut self, resource: &str) -> Self {
        self.info.resource = resource.trim_matches('/').to_string();
        self
    }
}

/// Registry of data access models
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: IndexMap<String, Arc<ModelInfo>>,
    by_resource: HashMap<String, String>,
    finalized: bool,
}

impl ModelRegistry {
    /// Create an empty registry in the building state
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model stored by this service
    pub fn register_local(
        &mut self,
        name: &str,
        hooks: Option<Arc<dyn ManagerHooks>>,
        schema: ModelSchema,
        filter: FilterSpec,
    ) -> Result<()> {
        let mut definition = ModelDefinition::local(name, schema).filter(filter);
        definition.info.hooks = hooks;
        self.register(definition)
    }

    /// Register a model served by another service
    pub fn register_remote(
        &mut self,
        name: &str,
        config: RemoteConfig,
        schema: ModelSchema,
    ) -> Result<()> {
        self.register(ModelDefinition::remote(name, config, schema))
    }

    /// Register a model definition.
    ///
    /// Registering an identical definition twice is a no-op; a different
    /// definition under an existing name is a configuration error.
    pub fn register(&mut self, definition: ModelDefinition) -> Result<()> {
        if self.finalized {
            return Err(Error::ConfigurationError(format!(
                "cannot register '{}': registry is already finalized",
                definition.info.name
            )));
        }

        let info = definition.info;
        require_identifier("model", &info.name)?;
        for field in info.schema.fields() {
            require_identifier("field", &field.name)?;
            let name = field.name.as_str();
            if RECORD_COLUMNS.contains(&name)
                || RESERVED_PARAMS.contains(&name)
                || RESERVED_FIELDS.contains(&name)
            {
                return Err(Error::ConfigurationError(format!(
                    "field '{}.{}' uses a reserved name",
                    info.name, field.name
                )));
            }
        }
        if info.resource.is_empty() || info.resource.contains('/') {
            return Err(Error::ConfigurationError(format!(
                "invalid resource path '{}' for '{}'",
                info.resource, info.name
            )));
        }

        if let Some(existing) = self.models.get(&info.name) {
            if existing.same_definition(&info) {
                tracing::debug!(model = %info.name, "Identical model registered twice, ignoring");
                return Ok(());
            }
            return Err(Error::ConfigurationError(format!(
                "model '{}' is already registered with a different definition",
                info.name
            )));
        }
        if let Some(owner) = self.by_resource.get(&info.resource) {
            return Err(Error::ConfigurationError(format!(
                "resource '{}' of '{}' is already used by '{}'",
                info.resource, info.name, owner
            )));
        }

        tracing::info!(
            model = %info.name,
            resource = %info.resource,
            access = if info.is_local() { "local" } else { "remote" },
            custom_hooks = info.hooks.is_some(),
            "Registered model"
        );
        self.by_resource
            .insert(info.resource.clone(), info.name.clone());
        self.models.insert(info.name.clone(), Arc::new(info));
        Ok(())
    }

    /// Register every model declared in configuration
    pub fn register_from_config(&mut self, models: &[ModelConfig]) -> Result<()> {
        for model in models {
            let schema = ModelSchema::from_fields(model.fields.iter().cloned());
            let mut definition = match &model.access {
                ModelAccessConfig::Local => ModelDefinition::local(&model.name, schema),
                ModelAccessConfig::Remote(remote) => {
                    ModelDefinition::remote(&model.name, remote.clone(), schema)
                }
            };
            if let Some(filter) = &model.filter {
                definition = definition.filter(filter.clone());
            }
            if let Some(resource) = &model.resource {
                definition = definition.resource(resource);
            }
            self.register(definition)?;
        }
        Ok(())
    }

    /// Finalize the registry.
    ///
    /// Phase one declares every registered entity; phase two resolves
    /// reference fields by name against those declarations and checks filter
    /// specs, so models may reference models registered after them.
    pub fn rebuild(&mut self) -> Result<()> {
        if self.finalized {
            return Err(Error::ConfigurationError(
                "registry has already been rebuilt".to_string(),
            ));
        }

        let declared: HashMap<String, bool> = self
            .models
            .values()
            .map(|info| (info.name.clone(), info.is_local()))
            .collect();

        let mut resolved = IndexMap::with_capacity(self.models.len());
        for (key, info) in &self.models {
            let mut info = ModelInfo::clone(info);

            let mut relations = Vec::new();
            for (field, target) in info.schema.references() {
                let target_key = model_key(target);
                let target_is_local = *declared.get(&target_key).ok_or_else(|| {
                    Error::ConfigurationError(format!(
                        "field '{}.{}' references unknown model '{}'",
                        info.name, field.name, target
                    ))
                })?;
                relations.push(Relation {
                    field: field.name.clone(),
                    target: target_key,
                    target_is_local,
                });
            }
            info.relations = relations;

            info.filter = info.filter.clone().resolve(&info.schema);
            info.filter.validate(&info.name, &info.schema)?;

            resolved.insert(key.clone(), Arc::new(info));
        }

        self.models = resolved;
        self.finalized = true;
        tracing::info!(models = self.models.len(), "Model registry finalized");
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Look up a model by name
    pub fn get_model_info(&self, name: &str) -> Result<Arc<ModelInfo>> {
        self.ensure_finalized()?;
        let key = model_key(name);
        self.models.get(&key).cloned().ok_or_else(|| {
            Error::ConfigurationError(format!(
                "model '{}' not found in registry; available: {:?}",
                name,
                self.models.keys().collect::<Vec<_>>()
            ))
        })
    }

    /// Look up a model by its URL path segment
    pub fn model_for_resource(&self, resource: &str) -> Result<Arc<ModelInfo>> {
        self.ensure_finalized()?;
        self.by_resource
            .get(resource)
            .and_then(|key| self.models.get(key))
            .cloned()
            .ok_or_else(|| {
                Error::ConfigurationError(format!("no model is served at '/{}'", resource))
            })
    }

    /// All models, in registration order
    pub fn models(&self) -> Result<impl Iterator<Item = &Arc<ModelInfo>>> {
        self.ensure_finalized()?;
        Ok(self.models.values())
    }

    fn ensure_finalized(&self) -> Result<()> {
        if self.finalized {
            Ok(())
        } else {
            Err(Error::ConfigurationError(
                "model registry has not been rebuilt".to_string(),
            ))
        }
    }
}
