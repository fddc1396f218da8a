//! Event shapes

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEventType {
    Created,
    Updated,
    Deleted,
}

/// A committed mutation of one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: ChangeEventType,
    pub model_name: String,
    pub id: Uuid,
    pub lsn: i64,
    pub tenant_id: Uuid,
}

impl ChangeEvent {
    pub fn new(
        event_type: ChangeEventType,
        model_name: &str,
        id: Uuid,
        lsn: i64,
        tenant_id: Uuid,
    ) -> Self {
        Self {
            event_type,
            model_name: model_name.to_string(),
            id,
            lsn,
            tenant_id,
        }
    }

    /// Wire form delivered to live sessions
    pub fn to_live(&self) -> LiveEvent {
        let event = match self.event_type {
            ChangeEventType::Created => LiveEventKind::ModelCreated,
            ChangeEventType::Updated => LiveEventKind::ModelUpdated,
            ChangeEventType::Deleted => LiveEventKind::ModelDeleted,
        };
        LiveEvent {
            event,
            payload: json!({
                "model_name": self.model_name,
                "id": self.id,
                "lsn": self.lsn,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiveEventKind {
    ModelCreated,
    ModelUpdated,
    ModelDeleted,
    Notification,
    ReloadView,
}

/// Message pushed to a live session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    pub event: LiveEventKind,
    pub payload: Value,
}
