//! Database connection handling
//!
//! This module provides functionality to establish and manage the SQLite pool
//! shared by every local manager and the durable broker.

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// Process-wide handle to the record store
#[derive(Debug, Clone)]
pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// Create a new database connection from configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool_size = config.pool_size.unwrap_or(10);
        let timeout_seconds = config.timeout_seconds.unwrap_or(30);
        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");

        if in_memory && pool_size != 1 {
            // Each pooled connection would open its own private database
            return Err(Error::ConfigurationError(format!(
                "in-memory database '{}' requires pool_size = 1",
                config.url
            )));
        }

        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(timeout_seconds));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(timeout_seconds));
        if in_memory {
            // Closing the only connection would drop the database
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        tracing::info!(url = %config.url, pool_size, "Connected to record store");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Execute a single SQL statement
    pub async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

const FINISHED: &str = "write transaction used after it finished";

/// Transaction started with `BEGIN IMMEDIATE`.
///
/// A deferred transaction that reads before it writes holds a snapshot it
/// cannot upgrade once another connection has committed, and SQLite fails
/// that upgrade with `SQLITE_BUSY` without consulting the busy timeout.
/// Taking the write lock up front makes concurrent writers queue on the
/// busy timeout instead.
pub struct WriteTransaction {
    conn: Option<PoolConnection<Sqlite>>,
}

impl WriteTransaction {
    pub async fn begin(pool: &SqlitePool) -> Result<Self> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Self { conn: Some(conn) })
    }

    /// Commit when `result` is `Ok`, roll back otherwise; returns `result`
    pub async fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        let statement = if result.is_ok() { "COMMIT" } else { "ROLLBACK" };
        if let Some(mut conn) = self.conn.take() {
            if let Err(error) = sqlx::query(statement).execute(&mut *conn).await {
                // The connection may still hold the transaction open
                drop(conn.detach());
                tracing::error!(error = %error, statement, "Failed to end write transaction");
                return match result {
                    Ok(_) => Err(error.into()),
                    Err(original) => Err(original),
                };
            }
        }
        result
    }
}

impl Deref for WriteTransaction {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        self.conn.as_deref().expect(FINISHED)
    }
}

impl DerefMut for WriteTransaction {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        self.conn.as_deref_mut().expect(FINISHED)
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        // Only reached when the owning future was cancelled mid-transaction
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                        tracing::error!(error = %error, "Failed to roll back abandoned transaction");
                        drop(conn.detach());
                    }
                });
            }
            // Closing the connection rolls the transaction back
            Err(_) => drop(conn.detach()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_memory_database_needs_a_single_connection() {
        let err = DatabaseConnection::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            pool_size: Some(2),
            timeout_seconds: None,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ConfigurationError(_)));

        let conn = DatabaseConnection::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            pool_size: Some(1),
            timeout_seconds: None,
        })
        .await
        .unwrap();
        conn.execute("CREATE TABLE t (x INTEGER)").await.unwrap();
        conn.execute("INSERT INTO t VALUES (1)").await.unwrap();
        conn.close().await;
    }

    #[tokio::test]
    async fn write_transaction_commits_only_on_success() {
        let conn = DatabaseConnection::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            pool_size: Some(1),
            timeout_seconds: None,
        })
        .await
        .unwrap();
        conn.execute("CREATE TABLE t (x INTEGER)").await.unwrap();

        let mut tx = WriteTransaction::begin(conn.pool()).await.unwrap();
        sqlx::query("INSERT INTO t VALUES (1)")
            .execute(&mut *tx)
            .await
            .unwrap();
        let failed: Result<()> = Err(Error::Internal("boom".to_string()));
        assert!(tx.finish(failed).await.is_err());

        let mut tx = WriteTransaction::begin(conn.pool()).await.unwrap();
        sqlx::query("INSERT INTO t VALUES (2)")
            .execute(&mut *tx)
            .await
            .unwrap();
        assert_eq!(tx.finish(Ok(7)).await.unwrap(), 7);

        let rows: Vec<i64> = sqlx::query_scalar("SELECT x FROM t")
            .fetch_all(conn.pool())
            .await
            .unwrap();
        assert_eq!(rows, vec![2]);
    }
}
