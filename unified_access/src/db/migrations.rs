//! Migration management
//!
//! The storage layout is derived from the registry: one shared `records`
//! table, one unique index per unique field of each local model, and the
//! tables of the durable broker. Applied steps are tracked by name in a
//! history table so `install` can run on every start.

use std::collections::HashSet;

use crate::db::connection::DatabaseConnection;
use crate::error::Result;
use crate::models::registry::ModelRegistry;
use crate::models::record::{format_timestamp, now};
use crate::utils::naming::unique_index_name;

const HISTORY_TABLE: &str = "schema_migrations";

/// A named DDL step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub name: String,
    pub sql: String,
}

impl Migration {
    fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Steps creating the record store
pub fn base_statements() -> Vec<Migration> {
    vec![
        Migration::new(
            "create_records",
            "CREATE TABLE IF NOT EXISTS records (
                model_name TEXT NOT NULL,
                id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                lsn INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                attributes TEXT NOT NULL,
                PRIMARY KEY (model_name, id)
            )",
        ),
        Migration::new(
            "index_records_created",
            "CREATE INDEX IF NOT EXISTS ix_records_created
                ON records (model_name, tenant_id, created_at, id)",
        ),
        Migration::new(
            "index_records_updated",
            "CREATE INDEX IF NOT EXISTS ix_records_updated
                ON records (model_name, tenant_id, updated_at, id)",
        ),
    ]
}

/// Steps creating the durable broker tables
pub fn broker_statements() -> Vec<Migration> {
    vec![
        Migration::new(
            "create_broker_tasks",
            "CREATE TABLE IF NOT EXISTS broker_tasks (
                task_id TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                enqueued_at TEXT NOT NULL,
                claimed_at TEXT
            )",
        ),
        Migration::new(
            "index_broker_tasks_pending",
            "CREATE INDEX IF NOT EXISTS ix_broker_tasks_pending
                ON broker_tasks (status, enqueued_at)",
        ),
        Migration::new(
            "create_broker_results",
            "CREATE TABLE IF NOT EXISTS broker_results (
                task_id TEXT PRIMARY KEY,
                outcome TEXT NOT NULL,
                completed_at TEXT NOT NULL
            )",
        ),
    ]
}

/// Every step needed by the models of a finalized registry
pub fn statements(registry: &ModelRegistry) -> Result<Vec<Migration>> {
    let mut migrations = base_statements();

    for info in registry.models()?.filter(|info| info.is_local()) {
        for field in info.schema.unique_fields() {
            // Model and field names are validated identifiers
            let index = unique_index_name(&info.name, &field.name);
            let sql = format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {index} \
                 ON records (tenant_id, json_extract(attributes, '$.{field}')) \
                 WHERE model_name = '{model}'",
                index = index,
                field = field.name,
                model = info.name,
            );
            migrations.push(Migration::new(index, sql));
        }
    }

    Ok(migrations)
}

/// Apply every step of `migrations` not yet recorded in the history table
pub async fn apply_migrations(
    connection: &DatabaseConnection,
    migrations: &[Migration],
) -> Result<usize> {
    ensure_migration_history_table(connection).await?;

    let applied: HashSet<String> =
        sqlx::query_scalar::<_, String>(&format!("SELECT name FROM {}", HISTORY_TABLE))
            .fetch_all(connection.pool())
            .await?
            .into_iter()
            .collect();

    let pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| !applied.contains(&m.name))
        .collect();
    if pending.is_empty() {
        tracing::debug!("Storage layout is up to date");
        return Ok(0);
    }

    let mut tx = connection.pool().begin().await?;
    for migration in &pending {
        tracing::info!(migration = %migration.name, "Applying migration");
        sqlx::query(&migration.sql).execute(&mut *tx).await?;
        sqlx::query(&format!(
            "INSERT INTO {} (name, applied_at) VALUES (?, ?)",
            HISTORY_TABLE
        ))
        .bind(&migration.name)
        .bind(format_timestamp(&now()))
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    tracing::info!(count = pending.len(), "Migrations applied successfully");
    Ok(pending.len())
}

/// Install the layout required by `registry`
pub async fn install(connection: &DatabaseConnection, registry: &ModelRegistry) -> Result<usize> {
    apply_migrations(connection, &statements(registry)?).await
}

async fn ensure_migration_history_table(connection: &DatabaseConnection) -> Result<()> {
    connection
        .execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            HISTORY_TABLE
        ))
        .await
}
