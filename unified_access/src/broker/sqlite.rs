//! Durable broker on SQLite tables
//!
//! Tasks sit in `broker_tasks` until a consumer claims them with a
//! conditional update (`pending` to `claimed`), so each task reaches exactly
//! one worker even when several poll the same database. Outcomes are written
//! to `broker_results` and removed when a waiter takes them, or by a sweep
//! once nobody has collected them within the retention period.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::time::Duration;
use uuid::Uuid;

use crate::broker::{Broker, ClaimedTask, TaskOutcome};
use crate::db::connection::DatabaseConnection;
use crate::db::migrations::{apply_migrations, broker_statements};
use crate::error::{Error, Result};
use crate::models::record::{format_timestamp, now};

pub struct SqliteBroker {
    pool: SqlitePool,
    poll_interval: Duration,
}

impl SqliteBroker {
    /// Open a broker on `connection`, creating its tables if needed
    pub async fn open(connection: &DatabaseConnection, poll_interval: Duration) -> Result<Self> {
        apply_migrations(connection, &broker_statements()).await?;
        Ok(Self {
            pool: connection.pool().clone(),
            poll_interval,
        })
    }

    /// Tasks not yet claimed
    pub async fn pending(&self) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM broker_tasks WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?,
        )
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn enqueue(&self, task_id: Uuid, body: String) -> Result<()> {
        sqlx::query(
            "INSERT INTO broker_tasks (task_id, body, status, enqueued_at) VALUES (?, ?, 'pending', ?)",
        )
        .bind(task_id.to_string())
        .bind(body)
        .bind(format_timestamp(&now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn receive(&self) -> Result<ClaimedTask> {
        loop {
            if let Some(task) = self.try_receive().await? {
                return Ok(task);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn try_receive(&self) -> Result<Option<ClaimedTask>> {
        loop {
            let candidate: Option<(String, String)> = sqlx::query_as(
                "SELECT task_id, body FROM broker_tasks
                 WHERE status = 'pending' ORDER BY enqueued_at, rowid LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await?;

            let Some((task_id, body)) = candidate else {
                return Ok(None);
            };

            let claimed = sqlx::query(
                "UPDATE broker_tasks SET status = 'claimed', claimed_at = ?
                 WHERE task_id = ? AND status = 'pending'",
            )
            .bind(format_timestamp(&now()))
            .bind(&task_id)
            .execute(&self.pool)
            .await?
            .rows_affected()
                == 1;

            if claimed {
                let task_id = Uuid::parse_str(&task_id)
                    .map_err(|e| Error::Internal(format!("corrupt task id '{}': {}", task_id, e)))?;
                return Ok(Some(ClaimedTask { task_id, body }));
            }
            // Another consumer won the race; look for the next task
        }
    }

    async fn complete(&self, task_id: Uuid, outcome: TaskOutcome) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO broker_results (task_id, outcome, completed_at) VALUES (?, ?, ?)",
        )
        .bind(task_id.to_string())
        .bind(serde_json::to_string(&outcome)?)
        .bind(format_timestamp(&now()))
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM broker_tasks WHERE task_id = ?")
            .bind(task_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn wait_result(&self, task_id: Uuid) -> Result<TaskOutcome> {
        let key = task_id.to_string();
        loop {
            let stored: Option<String> =
                sqlx::query_scalar("DELETE FROM broker_results WHERE task_id = ? RETURNING outcome")
                    .bind(&key)
                    .fetch_optional(&self.pool)
                    .await?;

            if let Some(outcome) = stored {
                return Ok(serde_json::from_str(&outcome)?);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn sweep(&self, retention: Duration) -> Result<usize> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| Error::ConfigurationError(format!("retention out of range: {}", e)))?;
        let Some(cutoff) = now().checked_sub_signed(retention) else {
            return Ok(0);
        };
        let cutoff = format_timestamp(&cutoff);

        let mut tx = self.pool.begin().await?;
        let outcomes = sqlx::query("DELETE FROM broker_results WHERE completed_at <= ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        // Claimed but never completed: the consumer died or was cancelled
        let claims =
            sqlx::query("DELETE FROM broker_tasks WHERE status = 'claimed' AND claimed_at <= ?")
                .bind(&cutoff)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        tx.commit().await?;

        if claims > 0 {
            tracing::warn!(claims, "Dropped tasks claimed but never completed");
        }
        Ok((outcomes + claims) as usize)
    }
}
