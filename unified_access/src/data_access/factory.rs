//! Manager resolution

use std::sync::Arc;

use crate::auth::RequestContext;
use crate::broker::BrokerTaskProxy;
use crate::data_access::{DataAccessManager, LocalManager, RemoteManager};
use crate::error::Result;
use crate::models::registry::AccessMode;
use crate::runtime::DataAccessRuntime;

/// Resolves managers for one request or task.
///
/// Cheap to build: it only pairs the process-wide runtime with the caller's
/// context. Managers it returns borrow the runtime's pool, HTTP client and
/// broadcaster.
#[derive(Clone)]
pub struct ManagerFactory {
    runtime: Arc<DataAccessRuntime>,
    context: RequestContext,
}

impl ManagerFactory {
    pub fn new(runtime: Arc<DataAccessRuntime>, context: RequestContext) -> Self {
        Self { runtime, context }
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Manager executing directly against the model's strategy
    pub fn get_manager(&self, model_name: &str) -> Result<DataAccessManager> {
        let info = self.runtime.registry().get_model_info(model_name)?;

        let manager = match &info.access {
            AccessMode::Local => DataAccessManager::Local(LocalManager::new(
                info.clone(),
                self.runtime.database().pool().clone(),
                self.runtime.notifier().clone(),
                self.context.clone(),
                self.runtime.config().pagination.clone(),
            )),
            AccessMode::Remote(remote) => DataAccessManager::Remote(RemoteManager::new(
                info.clone(),
                remote.clone(),
                self.runtime.http_client().clone(),
                self.context.credential.clone(),
            )),
        };
        Ok(manager)
    }

    /// Proxy deferring the model's operations to a worker
    pub fn broker_proxy(&self, model_name: &str) -> Result<BrokerTaskProxy> {
        let info = self.runtime.registry().get_model_info(model_name)?;
        Ok(BrokerTaskProxy::new(
            &info.name,
            self.runtime.broker().clone(),
            self.context.clone(),
            self.runtime.result_timeout(),
        ))
    }
}
