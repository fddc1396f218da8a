//! Deferred execution through a task queue
//!
//! A [`BrokerTaskProxy`] turns a manager call into a [`TaskMessage`] and puts
//! it on a [`Broker`]; a [`Worker`] claims it, runs it against a real manager
//! and stores a [`TaskOutcome`] the waiting [`TaskHandle`] picks up.

pub mod memory;
pub mod message;
pub mod proxy;
pub mod sqlite;
pub mod worker;

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

pub use memory::MemoryBroker;
pub use message::{TaskCall, TaskMessage, TaskMethod, TaskOutcome};
pub use proxy::{BrokerTaskProxy, TaskHandle};
pub use sqlite::SqliteBroker;
pub use worker::Worker;

/// A task handed to exactly one consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub task_id: Uuid,
    /// Serialized [`TaskMessage`]
    pub body: String,
}

/// Queue and result store
#[async_trait]
pub trait Broker: Send + Sync {
    /// Queue a serialized task
    async fn enqueue(&self, task_id: Uuid, body: String) -> Result<()>;

    /// Wait until a task is available and claim it
    async fn receive(&self) -> Result<ClaimedTask>;

    /// Claim a task if one is pending
    async fn try_receive(&self) -> Result<Option<ClaimedTask>>;

    /// Store the outcome of a claimed task
    async fn complete(&self, task_id: Uuid, outcome: TaskOutcome) -> Result<()>;

    /// Wait until the outcome of `task_id` is stored, then take it.
    ///
    /// Never times out by itself; callers bound it.
    async fn wait_result(&self, task_id: Uuid) -> Result<TaskOutcome>;

    /// Drop outcomes nobody collected and claims never completed, both
    /// older than `retention`. Returns how many entries went.
    async fn sweep(&self, retention: Duration) -> Result<usize>;
}
