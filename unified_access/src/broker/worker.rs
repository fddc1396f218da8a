//! Consumer side of the broker

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::auth::RequestContext;
use crate::broker::{ClaimedTask, TaskCall, TaskMessage, TaskOutcome};
use crate::data_access::ManagerFactory;
use crate::error::{Error, Result};
use crate::runtime::DataAccessRuntime;

/// Drains the runtime's broker, executing each task against a real manager
pub struct Worker {
    runtime: Arc<DataAccessRuntime>,
}

impl Worker {
    pub fn new(runtime: Arc<DataAccessRuntime>) -> Self {
        Self { runtime }
    }

    /// Process tasks until `shutdown` resolves, sweeping stale broker
    /// entries in the background
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let sweeper = tokio::spawn(sweep_periodically(self.runtime.clone()));
        tracing::info!("Worker started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    sweeper.abort();
                    tracing::info!("Worker stopping");
                    return Ok(());
                }
                received = self.runtime.broker().receive() => match received {
                    Ok(task) => {
                        self.handle(task).await;
                    }
                    Err(error) => {
                        tracing::error!(error = %error, "Failed to receive task");
                        tokio::time::sleep(self.runtime.poll_interval()).await;
                    }
                }
            }
        }
    }

    /// Process every task currently queued; returns how many ran
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        while let Some(task) = self.runtime.broker().try_receive().await? {
            self.handle(task).await;
            processed += 1;
        }
        Ok(processed)
    }

    /// Run one task and record its outcome. Never fails: every error of the
    /// task itself, a panic included, is stored as its outcome.
    async fn handle(&self, task: ClaimedTask) {
        let task_id = task.task_id;
        let started = std::time::Instant::now();
        let runtime = self.runtime.clone();
        let result = match tokio::spawn(Self::execute(runtime, task)).await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => Err(Error::Internal(format!(
                "task panicked: {}",
                panic_message(join_error.into_panic())
            ))),
            Err(join_error) => Err(Error::Internal(format!("task aborted: {}", join_error))),
        };
        let outcome = TaskOutcome::from_result(result);

        match &outcome {
            TaskOutcome::Success { .. } => {
                tracing::debug!(%task_id, elapsed = ?started.elapsed(), "Task succeeded")
            }
            TaskOutcome::Error { error_detail } => tracing::warn!(
                %task_id,
                error = ?error_detail.kind,
                detail = %error_detail.message,
                "Task failed"
            ),
        }

        if let Err(error) = self.complete_with_retry(task_id, outcome).await {
            tracing::error!(%task_id, error = %error, "Failed to record task outcome");
        }
    }

    async fn execute(
        runtime: Arc<DataAccessRuntime>,
        task: ClaimedTask,
    ) -> Result<serde_json::Value> {
        let message: TaskMessage = serde_json::from_str(&task.body)
            .map_err(|e| Error::Validation(format!("undecodable task message: {}", e)))?;
        if message.task_id != task.task_id {
            return Err(Error::Validation(format!(
                "task body carries id {} but was queued as {}",
                message.task_id, task.task_id
            )));
        }

        let context = RequestContext {
            principal: message.principal,
            credential: message.credential,
        };
        let manager = ManagerFactory::new(runtime, context)
            .get_manager(&message.model_name)?;
        let call = TaskCall::from_parts(message.method, message.args)?;

        call.execute(&manager).await
    }

    async fn complete_with_retry(&self, task_id: Uuid, outcome: TaskOutcome) -> Result<()> {
        match self.runtime.broker().complete(task_id, outcome.clone()).await {
            Ok(()) => Ok(()),
            Err(error) => {
                tracing::warn!(%task_id, error = %error, "Retrying outcome write");
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.runtime.broker().complete(task_id, outcome).await
            }
        }
    }
}

async fn sweep_periodically(runtime: Arc<DataAccessRuntime>) {
    let retention = runtime.result_retention();
    let mut ticks = tokio::time::interval((retention / 4).max(Duration::from_millis(100)));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;
        match runtime.broker().sweep(retention).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Swept stale broker entries"),
            Err(error) => tracing::warn!(error = %error, "Broker sweep failed"),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .unwrap_or_else(|| "non-string panic payload".to_string()),
    }
}
