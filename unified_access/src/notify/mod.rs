//! Change notification fan-out
//!
//! Local managers publish a [`ChangeEvent`] after every committed mutation.
//! The [`ChangeBroadcaster`] copies it into the bounded queue of each
//! interested [`Subscription`] without ever waiting on a subscriber.

pub mod broadcaster;
pub mod event;

use serde::{Deserialize, Serialize};

pub use broadcaster::{ChangeBroadcaster, SubscriberFilter, Subscription};
pub use event::{ChangeEvent, ChangeEventType, LiveEvent, LiveEventKind};

/// What a full subscriber queue does with a new event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest queued event to make room
    #[default]
    DropOldest,
    /// Discard the incoming event
    DropNewest,
}
