//! Opaque keyset cursors
//!
//! A cursor records the sort value and id of the last row of a page together
//! with the ordering it was produced under. The next page starts strictly
//! after that `(value, id)` position, so rows inserted or deleted elsewhere
//! never shift the traversal.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::filter::OrderBy;
use crate::models::record::{format_timestamp, Record};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Ordering in `order_by` form, e.g. `-created_at`
    #[serde(rename = "o")]
    pub order: String,
    /// Sort value of the last returned row
    #[serde(rename = "v")]
    pub value: Value,
    /// Id of the last returned row
    pub id: Uuid,
}

impl Cursor {
    /// Position just after `record` under `order`
    pub fn after(record: &Record, order: &OrderBy) -> Self {
        Self {
            order: order.to_string(),
            value: sort_value(record, &order.field),
            id: record.id,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    /// Decode a token and check it belongs to a traversal under `order`
    pub fn decode(token: &str, order: &OrderBy) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| Error::Validation("malformed cursor".to_string()))?;
        let cursor: Cursor = serde_json::from_slice(&bytes)
            .map_err(|_| Error::Validation("malformed cursor".to_string()))?;

        if cursor.order != order.to_string() {
            return Err(Error::Validation(format!(
                "cursor was issued for order_by={} but the request uses order_by={}",
                cursor.order, order
            )));
        }
        Ok(cursor)
    }
}

/// Value of the sort field as stored, so it compares like the column does
pub fn sort_value(record: &Record, field: &str) -> Value {
    match field {
        "created_at" => Value::String(format_timestamp(&record.created_at)),
        "updated_at" => Value::String(format_timestamp(&record.updated_at)),
        other => record.get(other).cloned().unwrap_or(Value::Null),
    }
}
