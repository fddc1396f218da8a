//! Models module
//!
//! Model declarations: schemas, filter specs, record shapes and the registry
//! that ties them to an execution strategy.

pub mod filter;
pub mod record;
pub mod registry;
pub mod schema;

// Re-export key types
pub use filter::{Direction, FilterSpec, ListFilter, ListQuery, OrderBy};
pub use record::{Attributes, PaginatedResponse, Record};
pub use registry::{
    AccessMode, AuthStrategy, ModelDefinition, ModelInfo, ModelRegistry, Relation, RemoteConfig,
};
pub use schema::{FieldDefinition, FieldType, ModelSchema};
