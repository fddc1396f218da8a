//! In-process broker

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::{Broker, ClaimedTask, TaskOutcome};
use crate::error::Result;

/// Broker living in the memory of one process, for tests and single-node
/// deployments where the worker runs in process.
#[derive(Default)]
pub struct MemoryBroker {
    tasks: Mutex<VecDeque<ClaimedTask>>,
    /// Outcomes with the instant they were stored
    results: Mutex<HashMap<Uuid, (TaskOutcome, Instant)>>,
    task_ready: Notify,
    result_ready: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks not yet claimed
    pub async fn pending(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, task_id: Uuid, body: String) -> Result<()> {
        self.tasks
            .lock()
            .await
            .push_back(ClaimedTask { task_id, body });
        self.task_ready.notify_one();
        Ok(())
    }

    async fn receive(&self) -> Result<ClaimedTask> {
        loop {
            let notified = self.task_ready.notified();
            if let Some(task) = self.try_receive().await? {
                return Ok(task);
            }
            notified.await;
        }
    }

    async fn try_receive(&self) -> Result<Option<ClaimedTask>> {
        Ok(self.tasks.lock().await.pop_front())
    }

    async fn complete(&self, task_id: Uuid, outcome: TaskOutcome) -> Result<()> {
        self.results
            .lock()
            .await
            .insert(task_id, (outcome, Instant::now()));
        self.result_ready.notify_waiters();
        Ok(())
    }

    async fn wait_result(&self, task_id: Uuid) -> Result<TaskOutcome> {
        loop {
            // Register interest before checking so a completion in between
            // still wakes this waiter
            let notified = self.result_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some((outcome, _)) = self.results.lock().await.remove(&task_id) {
                return Ok(outcome);
            }
            notified.await;
        }
    }

    async fn sweep(&self, retention: Duration) -> Result<usize> {
        // Claimed tasks leave the queue, so only outcomes can go stale here
        let mut results = self.results.lock().await;
        let before = results.len();
        results.retain(|_, (_, completed_at)| completed_at.elapsed() < retention);
        Ok(before - results.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn tasks_are_claimed_once_in_order() {
        let broker = MemoryBroker::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        broker.enqueue(a, "a".to_string()).await.unwrap();
        broker.enqueue(b, "b".to_string()).await.unwrap();
        assert_eq!(broker.pending().await, 2);

        assert_eq!(broker.receive().await.unwrap().task_id, a);
        assert_eq!(broker.try_receive().await.unwrap().unwrap().task_id, b);
        assert!(broker.try_receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn waiter_wakes_on_completion() {
        let broker = Arc::new(MemoryBroker::new());
        let task_id = Uuid::new_v4();

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.wait_result(task_id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker
            .complete(task_id, TaskOutcome::Success { value: json!(1) })
            .await
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Success { value: json!(1) });
    }

    #[tokio::test]
    async fn uncollected_outcomes_are_swept() {
        let broker = MemoryBroker::new();
        let task_id = Uuid::new_v4();
        broker
            .complete(task_id, TaskOutcome::Success { value: json!(1) })
            .await
            .unwrap();

        assert_eq!(broker.sweep(Duration::from_secs(60)).await.unwrap(), 0);
        assert_eq!(broker.sweep(Duration::ZERO).await.unwrap(), 1);

        let waited =
            tokio::time::timeout(Duration::from_millis(50), broker.wait_result(task_id)).await;
        assert!(waited.is_err());
    }
}
