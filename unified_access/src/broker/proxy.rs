//! Producer side of the broker

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::RequestContext;
use crate::broker::{Broker, TaskCall, TaskMessage, TaskOutcome};
use crate::error::{Error, Result};
use crate::models::filter::ListQuery;
use crate::models::record::{Attributes, PaginatedResponse, Record};

/// Pending result of an enqueued task.
///
/// Dropping the handle abandons the result; the task still runs.
pub struct TaskHandle {
    task_id: Uuid,
    broker: Arc<dyn Broker>,
}

impl TaskHandle {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Wait at most `timeout` for the worker's outcome.
    ///
    /// A failed task surfaces as `RemoteTask` wrapping the worker-side
    /// error; no outcome in time is `TaskTimeout`.
    pub async fn wait(&self, timeout: Duration) -> Result<Value> {
        let outcome = tokio::time::timeout(timeout, self.broker.wait_result(self.task_id))
            .await
            .map_err(|_| Error::TaskTimeout {
                task_id: self.task_id,
                timeout,
            })??;

        match outcome {
            TaskOutcome::Success { value } => Ok(value),
            TaskOutcome::Error { error_detail } => Err(Error::RemoteTask {
                task_id: self.task_id,
                source: Box::new(error_detail.into_error()),
            }),
        }
    }
}

/// Defers one model's operations to a worker
pub struct BrokerTaskProxy {
    model_name: String,
    broker: Arc<dyn Broker>,
    context: RequestContext,
    default_timeout: Duration,
}

impl BrokerTaskProxy {
    pub fn new(
        model_name: &str,
        broker: Arc<dyn Broker>,
        context: RequestContext,
        default_timeout: Duration,
    ) -> Self {
        Self {
            model_name: model_name.to_string(),
            broker,
            context,
            default_timeout,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Queue `call` and return a handle to its result
    pub async fn enqueue(&self, call: TaskCall) -> Result<TaskHandle> {
        let message = TaskMessage {
            task_id: Uuid::new_v4(),
            model_name: self.model_name.clone(),
            method: call.method(),
            args: call.args()?,
            principal: self.context.principal.clone(),
            credential: self.context.credential.clone(),
        };

        self.broker
            .enqueue(message.task_id, serde_json::to_string(&message)?)
            .await?;
        tracing::debug!(
            task_id = %message.task_id,
            model = %self.model_name,
            method = ?message.method,
            "Task enqueued"
        );

        Ok(TaskHandle {
            task_id: message.task_id,
            broker: self.broker.clone(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, call: TaskCall) -> Result<T> {
        let handle = self.enqueue(call).await?;
        let value = handle.wait(self.default_timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn list(&self, query: ListQuery) -> Result<PaginatedResponse> {
        self.call(TaskCall::List(query)).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Record> {
        self.call(TaskCall::Get(id)).await
    }

    pub async fn create(&self, payload: Attributes) -> Result<Record> {
        self.call(TaskCall::Create(payload)).await
    }

    pub async fn update(
        &self,
        id: Uuid,
        payload: Attributes,
        expected_lsn: Option<i64>,
    ) -> Result<Record> {
        self.call(TaskCall::Update {
            id,
            payload,
            expected_lsn,
        })
        .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.call::<Value>(TaskCall::Delete(id)).await?;
        Ok(())
    }
}
