//! Data access managers
//!
//! Every model is reached through the same five operations regardless of
//! where its records live. [`ManagerFactory`] picks the implementation from
//! the registry: [`LocalManager`] for models stored here, [`RemoteManager`]
//! for models served by another service.

pub mod cursor;
pub mod factory;
pub mod hooks;
pub mod local;
pub mod remote;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::filter::ListQuery;
use crate::models::record::{Attributes, PaginatedResponse, Record};

pub use factory::ManagerFactory;
pub use hooks::{DefaultHooks, ManagerHooks};
pub use local::LocalManager;
pub use remote::RemoteManager;

/// The CRUD contract shared by every execution strategy
#[async_trait]
pub trait DataAccess: Send + Sync {
    /// Registry key of the model this manager serves
    fn model_name(&self) -> &str;

    /// One page of records, ordered and filtered per `query`
    async fn list(&self, query: ListQuery) -> Result<PaginatedResponse>;

    async fn get(&self, id: Uuid) -> Result<Record>;

    /// Create a record in the caller's tenant with `lsn = 1`
    async fn create(&self, payload: Attributes) -> Result<Record>;

    /// Merge `payload` into the record.
    ///
    /// With `expected_lsn`, fails with `Conflict` unless the stored LSN
    /// matches; a payload that changes nothing returns the record as is.
    async fn update(
        &self,
        id: Uuid,
        payload: Attributes,
        expected_lsn: Option<i64>,
    ) -> Result<Record>;

    async fn delete(&self, id: Uuid) -> Result<()>;
}

/// A resolved manager
pub enum DataAccessManager {
    Local(LocalManager),
    Remote(RemoteManager),
}

impl DataAccessManager {
    pub fn is_local(&self) -> bool {
        matches!(self, DataAccessManager::Local(_))
    }

    fn inner(&self) -> &dyn DataAccess {
        match self {
            DataAccessManager::Local(manager) => manager,
            DataAccessManager::Remote(manager) => manager,
        }
    }
}

#[async_trait]
impl DataAccess for DataAccessManager {
    fn model_name(&self) -> &str {
        self.inner().model_name()
    }

    async fn list(&self, query: ListQuery) -> Result<PaginatedResponse> {
        self.inner().list(query).await
    }

    async fn get(&self, id: Uuid) -> Result<Record> {
        self.inner().get(id).await
    }

    async fn create(&self, payload: Attributes) -> Result<Record> {
        self.inner().create(payload).await
    }

    async fn update(
        &self,
        id: Uuid,
        payload: Attributes,
        expected_lsn: Option<i64>,
    ) -> Result<Record> {
        self.inner().update(id, payload, expected_lsn).await
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.inner().delete(id).await
    }
}
