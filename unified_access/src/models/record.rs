//! Record and page shapes shared by every manager

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Arbitrary attribute bag of a record
pub type Attributes = Map<String, Value>;

/// A stored row of any model.
///
/// Attributes are flattened on the wire so a record serializes as a single
/// JSON object: `{"id": ..., "lsn": 1, "tenant_id": ..., "name": "A"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Uuid,
    pub lsn: i64,
    pub tenant_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub attributes: Attributes,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.attributes.get(field)
    }
}

/// One page of a cursor traversal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginatedResponse {
    pub items: Vec<Record>,
    pub next_cursor: Option<String>,
    pub limit: u32,
    pub count: usize,
}

/// Current time at the precision storage keeps
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width text form of a timestamp; lexical order equals time order
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}
