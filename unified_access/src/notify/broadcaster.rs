//! Bounded, non-blocking fan-out to live subscribers

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::NotificationConfig;
use crate::notify::event::{ChangeEvent, LiveEvent, LiveEventKind};
use crate::notify::DropPolicy;

/// Which events a subscriber wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriberFilter {
    /// Tenant whose model events are delivered; `None` receives every tenant
    pub tenant_id: Option<Uuid>,
    /// User addressed by direct notifications
    pub user_id: Option<Uuid>,
}

impl SubscriberFilter {
    pub fn tenant(tenant_id: Uuid) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            user_id: None,
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    fn wants_tenant(&self, tenant_id: Uuid) -> bool {
        self.tenant_id.map_or(true, |t| t == tenant_id)
    }
}

enum Audience {
    Tenant(Uuid),
    User(Uuid),
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<LiveEvent>,
    dropped: u64,
}

struct SubscriberQueue {
    filter: SubscriberFilter,
    capacity: usize,
    policy: DropPolicy,
    state: Mutex<QueueState>,
    ready: Notify,
}

impl SubscriberQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn accepts(&self, audience: &Audience) -> bool {
        match audience {
            Audience::Tenant(tenant_id) => self.filter.wants_tenant(*tenant_id),
            Audience::User(user_id) => self.filter.user_id == Some(*user_id),
        }
    }

    /// Returns false when the event was discarded
    fn push(&self, event: LiveEvent) -> bool {
        let mut state = self.lock();
        let kept = if state.events.len() < self.capacity {
            state.events.push_back(event);
            true
        } else {
            state.dropped += 1;
            match self.policy {
                DropPolicy::DropOldest => {
                    state.events.pop_front();
                    state.events.push_back(event);
                    true
                }
                DropPolicy::DropNewest => false,
            }
        };
        drop(state);
        if kept {
            self.ready.notify_one();
        }
        kept
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Wait for the next event
    pub async fn recv(&self) -> LiveEvent {
        loop {
            let notified = self.queue.ready.notified();
            if let Some(event) = self.try_recv() {
                return event;
            }
            notified.await;
        }
    }

    /// Take the next event if one is queued
    pub fn try_recv(&self) -> Option<LiveEvent> {
        self.queue.lock().events.pop_front()
    }

    /// Events lost to the drop policy so far
    pub fn dropped(&self) -> u64 {
        self.queue.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.queue.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn filter(&self) -> SubscriberFilter {
        self.queue.filter
    }
}

/// Fan-out hub shared by every manager of the process
pub struct ChangeBroadcaster {
    capacity: usize,
    policy: DropPolicy,
    subscribers: Mutex<Vec<Weak<SubscriberQueue>>>,
}

impl ChangeBroadcaster {
    pub fn new(capacity: usize, policy: DropPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        Self::new(config.queue_capacity, config.drop_policy)
    }

    /// Register a subscriber with the default queue capacity
    pub fn subscribe(&self, filter: SubscriberFilter) -> Subscription {
        self.subscribe_with_capacity(filter, self.capacity)
    }

    pub fn subscribe_with_capacity(&self, filter: SubscriberFilter, capacity: usize) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            filter,
            capacity: capacity.max(1),
            policy: self.policy,
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
        });
        self.lock().push(Arc::downgrade(&queue));
        tracing::debug!(tenant_id = ?filter.tenant_id, user_id = ?filter.user_id, "Subscriber added");
        Subscription { queue }
    }

    /// Deliver a model change to every subscriber of its tenant.
    ///
    /// Never waits on a subscriber; returns how many queues accepted it.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let delivered = self.deliver(Audience::Tenant(event.tenant_id), event.to_live());
        tracing::trace!(
            model = %event.model_name,
            id = %event.id,
            lsn = event.lsn,
            delivered,
            "Published change event"
        );
        delivered
    }

    /// Send a direct notification to the sessions of one user
    pub fn notify_user(&self, user_id: Uuid, payload: Value) -> usize {
        self.deliver(
            Audience::User(user_id),
            LiveEvent {
                event: LiveEventKind::Notification,
                payload,
            },
        )
    }

    /// Ask every session of a tenant to refresh its view
    pub fn reload_view(&self, tenant_id: Uuid) -> usize {
        self.deliver(
            Audience::Tenant(tenant_id),
            LiveEvent {
                event: LiveEventKind::ReloadView,
                payload: Value::Null,
            },
        )
    }

    /// Live subscribers; dropped subscriptions are pruned first
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.len()
    }

    fn deliver(&self, audience: Audience, event: LiveEvent) -> usize {
        // Snapshot live queues so pushes happen outside the registry lock
        let targets: Vec<Arc<SubscriberQueue>> = {
            let mut subscribers = self.lock();
            subscribers.retain(|weak| weak.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };

        let mut delivered = 0;
        for queue in targets.iter().filter(|q| q.accepts(&audience)) {
            if queue.push(event.clone()) {
                delivered += 1;
            } else {
                tracing::debug!("Subscriber queue full, event dropped");
            }
        }
        delivered
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Weak<SubscriberQueue>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::event::ChangeEventType;
    use serde_json::json;

    fn created(tenant_id: Uuid, lsn: i64) -> ChangeEvent {
        ChangeEvent::new(ChangeEventType::Created, "product", Uuid::new_v4(), lsn, tenant_id)
    }

    #[test]
    fn events_are_filtered_by_tenant() {
        let broadcaster = ChangeBroadcaster::new(8, DropPolicy::DropOldest);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let sub_a = broadcaster.subscribe(SubscriberFilter::tenant(a));
        let sub_all = broadcaster.subscribe(SubscriberFilter::default());

        broadcaster.publish(&created(a, 1));
        broadcaster.publish(&created(b, 1));

        assert_eq!(sub_a.len(), 1);
        assert_eq!(sub_all.len(), 2);
    }

    #[test]
    fn drop_newest_keeps_the_head_of_the_burst() {
        let broadcaster = ChangeBroadcaster::new(2, DropPolicy::DropNewest);
        let tenant = Uuid::new_v4();
        let sub = broadcaster.subscribe(SubscriberFilter::tenant(tenant));

        for lsn in 1..=5 {
            broadcaster.publish(&created(tenant, lsn));
        }

        assert_eq!(sub.dropped(), 3);
        let first = sub.try_recv().unwrap();
        assert_eq!(first.payload["lsn"], json!(1));
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let broadcaster = ChangeBroadcaster::new(4, DropPolicy::DropOldest);
        let keep = broadcaster.subscribe(SubscriberFilter::default());
        let gone = broadcaster.subscribe(SubscriberFilter::default());
        assert_eq!(broadcaster.subscriber_count(), 2);

        drop(gone);
        assert_eq!(broadcaster.publish(&created(Uuid::new_v4(), 1)), 1);
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(keep.len(), 1);
    }

    #[test]
    fn user_notifications_reach_only_that_user() {
        let broadcaster = ChangeBroadcaster::new(4, DropPolicy::DropOldest);
        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();
        let mine = broadcaster.subscribe(SubscriberFilter::tenant(tenant).user(user));
        let other = broadcaster.subscribe(SubscriberFilter::tenant(tenant));

        broadcaster.notify_user(user, json!({"message": "export ready"}));
        broadcaster.reload_view(tenant);

        assert_eq!(mine.try_recv().unwrap().event, LiveEventKind::Notification);
        assert_eq!(mine.try_recv().unwrap().event, LiveEventKind::ReloadView);
        assert_eq!(other.try_recv().unwrap().event, LiveEventKind::ReloadView);
        assert!(other.is_empty());
    }
}
