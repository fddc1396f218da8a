//! CRUD HTTP surface
//!
//! Every registered model is served under its resource path:
//!
//! | Method | Path | Operation |
//! |---|---|---|
//! | GET | `/{resource}` | list |
//! | POST | `/{resource}` | create (201) |
//! | GET | `/{resource}/{id}` | get |
//! | PUT | `/{resource}/{id}` | update, body may carry `expected_lsn` |
//! | DELETE | `/{resource}/{id}` | delete (204) |
//!
//! Callers authenticate with a bearer credential; the remote manager of a
//! peer service speaks exactly this protocol.

pub mod error;

use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{Authenticator, RequestContext};
use crate::data_access::DataAccess;
use crate::error::{Error, Result};
use crate::models::filter::ListQuery;
use crate::models::record::{Attributes, PaginatedResponse, Record};
use crate::models::registry::ModelInfo;
use crate::runtime::DataAccessRuntime;

pub use error::ApiError;

/// Shared state of the router
#[derive(Clone)]
pub struct AppState {
    runtime: Arc<DataAccessRuntime>,
    authenticator: Arc<dyn Authenticator>,
}

impl AppState {
    pub fn new(runtime: Arc<DataAccessRuntime>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            runtime,
            authenticator,
        }
    }
}

/// Create the router serving every registered model
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/{resource}", get(list_records).post(create_record))
        .route(
            "/{resource}/{id}",
            get(get_record).put(update_record).delete(delete_record),
        )
        .with_state(state)
}

/// Serve the router on `bind` until `shutdown` resolves
pub async fn serve<F>(state: AppState, bind: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(address = %listener.local_addr()?, "HTTP surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> std::result::Result<RequestContext, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| Error::Authentication("missing bearer credential".to_string()))?;

    let principal = state.authenticator.authenticate(token).await?;
    Ok(RequestContext::new(principal).with_credential(token))
}

fn resolve(state: &AppState, resource: &str) -> std::result::Result<Arc<ModelInfo>, ApiError> {
    state
        .runtime
        .registry()
        .model_for_resource(resource)
        .map_err(|_| ApiError::unknown_resource(resource))
}

async fn list_records(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> std::result::Result<Json<PaginatedResponse>, ApiError> {
    let info = resolve(&state, &resource)?;
    let context = authenticate(&state, &headers).await?;
    let query = ListQuery::from_query_pairs(
        params.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        &info.schema,
    )?;

    let manager = state.runtime.factory(context).get_manager(&info.name)?;
    Ok(Json(manager.list(query).await?))
}

async fn get_record(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, Uuid)>,
    headers: HeaderMap,
) -> std::result::Result<Json<Record>, ApiError> {
    let info = resolve(&state, &resource)?;
    let context = authenticate(&state, &headers).await?;

    let manager = state.runtime.factory(context).get_manager(&info.name)?;
    Ok(Json(manager.get(id).await?))
}

async fn create_record(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Attributes>,
) -> std::result::Result<(StatusCode, Json<Record>), ApiError> {
    let info = resolve(&state, &resource)?;
    let context = authenticate(&state, &headers).await?;

    let manager = state.runtime.factory(context).get_manager(&info.name)?;
    let record = manager.create(payload).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn update_record(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, Uuid)>,
    headers: HeaderMap,
    Json(mut payload): Json<Attributes>,
) -> std::result::Result<Json<Record>, ApiError> {
    let info = resolve(&state, &resource)?;
    let context = authenticate(&state, &headers).await?;

    let expected_lsn = match payload.remove("expected_lsn") {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.as_i64().ok_or_else(|| {
            Error::Validation("expected_lsn must be an integer".to_string())
        })?),
    };

    let manager = state.runtime.factory(context).get_manager(&info.name)?;
    Ok(Json(manager.update(id, payload, expected_lsn).await?))
}

async fn delete_record(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, Uuid)>,
    headers: HeaderMap,
) -> std::result::Result<StatusCode, ApiError> {
    let info = resolve(&state, &resource)?;
    let context = authenticate(&state, &headers).await?;

    let manager = state.runtime.factory(context).get_manager(&info.name)?;
    manager.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
