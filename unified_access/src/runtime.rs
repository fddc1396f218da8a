//! Process-wide resources
//!
//! A [`DataAccessRuntime`] is opened once per process and shared through an
//! `Arc`. It owns everything managers borrow: the SQLite pool, the pooled
//! HTTP client, the broker and the change broadcaster.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::RequestContext;
use crate::broker::{Broker, MemoryBroker, SqliteBroker};
use crate::config::{BrokerBackend, Config};
use crate::data_access::remote::RemoteClient;
use crate::data_access::ManagerFactory;
use crate::db::connection::DatabaseConnection;
use crate::db::migrations;
use crate::error::{Error, Result};
use crate::models::registry::ModelRegistry;
use crate::notify::ChangeBroadcaster;

pub struct DataAccessRuntime {
    config: Config,
    registry: Arc<ModelRegistry>,
    database: DatabaseConnection,
    http_client: RemoteClient,
    broker: Arc<dyn Broker>,
    notifier: Arc<ChangeBroadcaster>,
}

impl DataAccessRuntime {
    /// Open the runtime for a finalized registry
    pub async fn open(config: Config, registry: Arc<ModelRegistry>) -> Result<Arc<Self>> {
        if !registry.is_finalized() {
            return Err(Error::ConfigurationError(
                "the model registry must be rebuilt before opening the runtime".to_string(),
            ));
        }

        let database = DatabaseConnection::connect(&config.database).await?;
        migrations::install(&database, &registry).await?;

        let http_client = RemoteClient::new(&config.http_client)?;

        let broker: Arc<dyn Broker> = match config.broker.backend {
            BrokerBackend::Memory => Arc::new(MemoryBroker::new()),
            BrokerBackend::Sqlite => Arc::new(
                SqliteBroker::open(
                    &database,
                    Duration::from_millis(config.broker.poll_interval_ms),
                )
                .await?,
            ),
        };

        let notifier = Arc::new(ChangeBroadcaster::from_config(&config.notifications));

        tracing::info!(
            models = registry.models()?.count(),
            broker = ?config.broker.backend,
            "Data access runtime opened"
        );

        Ok(Arc::new(Self {
            config,
            registry,
            database,
            http_client,
            broker,
            notifier,
        }))
    }

    /// Build and finalize a registry from the models declared in `config`,
    /// then open the runtime
    pub async fn from_config(config: Config) -> Result<Arc<Self>> {
        let mut registry = ModelRegistry::new();
        registry.register_from_config(&config.models)?;
        registry.rebuild()?;
        Self::open(config, Arc::new(registry)).await
    }

    /// Factory scoped to one caller
    pub fn factory(self: &Arc<Self>, context: RequestContext) -> ManagerFactory {
        ManagerFactory::new(self.clone(), context)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn database(&self) -> &DatabaseConnection {
        &self.database
    }

    pub fn http_client(&self) -> &RemoteClient {
        &self.http_client
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn notifier(&self) -> &Arc<ChangeBroadcaster> {
        &self.notifier
    }

    /// Default bound on waiting for a queued task
    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.config.broker.result_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.broker.poll_interval_ms)
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_secs(self.config.broker.result_retention_seconds)
    }

    /// Release the database pool
    pub async fn close(&self) {
        self.database.close().await;
        tracing::info!("Data access runtime closed");
    }
}
