//! Shared fixtures for the integration tests
#![allow(dead_code)]

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use unified_access::http::{self, AppState};
use unified_access::models::registry::RemoteConfig;
use unified_access::{
    Attributes, Config, DataAccessRuntime, FieldDefinition, FieldType, FilterSpec, ModelRegistry,
    ModelSchema, Principal, RequestContext, StaticAuthenticator,
};

pub fn category_schema() -> ModelSchema {
    ModelSchema::new().field(FieldDefinition::new("title", FieldType::String))
}

pub fn product_schema() -> ModelSchema {
    ModelSchema::new()
        .field(FieldDefinition::new("name", FieldType::String).max_length(100))
        .field(FieldDefinition::new("sku", FieldType::String).nullable(true).unique())
        .field(FieldDefinition::new("price", FieldType::Float))
        .field(FieldDefinition::new("active", FieldType::Boolean).default(json!(true)))
        .field(
            FieldDefinition::new("category_id", FieldType::Reference("Category".into()))
                .nullable(true),
        )
}

pub fn product_filter() -> FilterSpec {
    FilterSpec::default().sortable(["price", "name"])
}

/// Product and Category stored locally
pub fn local_registry() -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    registry
        .register_local("Product", None, product_schema(), product_filter())
        .unwrap();
    registry
        .register_local("Category", None, category_schema(), FilterSpec::default())
        .unwrap();
    registry.rebuild().unwrap();
    registry
}

/// Product and Category served by the service at `addr`
pub fn remote_registry(addr: SocketAddr) -> ModelRegistry {
    let remote = RemoteConfig::new(&format!("http://{}", addr), "catalog");
    let mut registry = ModelRegistry::new();
    registry
        .register(
            unified_access::models::ModelDefinition::remote("Product", remote.clone(), product_schema())
                .filter(product_filter()),
        )
        .unwrap();
    registry
        .register_remote("Category", remote, category_schema())
        .unwrap();
    registry.rebuild().unwrap();
    registry
}

pub async fn open_runtime(config: Config, registry: ModelRegistry) -> Arc<DataAccessRuntime> {
    DataAccessRuntime::open(config, Arc::new(registry))
        .await
        .expect("runtime opens")
}

pub async fn local_runtime() -> Arc<DataAccessRuntime> {
    open_runtime(Config::in_memory(), local_registry()).await
}

/// Tenant member holding every permission
pub fn member(tenant_id: Uuid) -> RequestContext {
    RequestContext::new(Principal::member(tenant_id, ["*"]))
}

pub fn attrs(value: Value) -> Attributes {
    value.as_object().cloned().expect("object payload")
}

/// Serve `runtime` over HTTP on an ephemeral port
pub async fn spawn_server(
    runtime: Arc<DataAccessRuntime>,
    authenticator: StaticAuthenticator,
) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = http::router(AppState::new(runtime, Arc::new(authenticator)));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
