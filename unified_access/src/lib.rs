//! Unified data access: one CRUD contract over local storage, remote services
//! and a task queue
//!
//! Models are declared once in a [`ModelRegistry`] with an access mode. A
//! [`ManagerFactory`] then hands out managers that all speak
//! [`DataAccess`]: records of local models are stored in SQLite with
//! per-record LSN optimistic concurrency and keyset cursor pagination, remote
//! models are reached over HTTP with the same error semantics, and any call
//! can be deferred to a worker through a [`BrokerTaskProxy`]. Committed
//! changes fan out to live subscribers through the [`ChangeBroadcaster`].

pub mod auth;
pub mod broker;
pub mod config;
pub mod data_access;
pub mod db;
pub mod error;
pub mod http;
pub mod models;
pub mod notify;
pub mod runtime;
pub mod utils;

// Re-export main types for easier access
pub use auth::{Action, Authenticator, Principal, RequestContext, StaticAuthenticator};
pub use broker::{BrokerTaskProxy, TaskHandle, Worker};
pub use config::Config;
pub use data_access::{DataAccess, DataAccessManager, ManagerFactory, ManagerHooks};
pub use error::{Error, ErrorKind, Result};
pub use models::{
    Attributes, FieldDefinition, FieldType, FilterSpec, ListFilter, ListQuery, ModelRegistry,
    ModelSchema, OrderBy, PaginatedResponse, Record,
};
pub use notify::{ChangeBroadcaster, ChangeEvent, LiveEvent, SubscriberFilter, Subscription};
pub use runtime::DataAccessRuntime;

/// Open a runtime from a configuration file, registering the models it
/// declares
pub async fn init(config_path: &str) -> Result<std::sync::Arc<DataAccessRuntime>> {
    let config = config::load_from_file(config_path)?;
    DataAccessRuntime::from_config(config).await
}
