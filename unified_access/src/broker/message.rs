//! Task wire format

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::Principal;
use crate::data_access::DataAccess;
use crate::error::{Error, ErrorDetail, Result};
use crate::models::filter::ListQuery;
use crate::models::record::Attributes;

/// Manager operation named by a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMethod {
    List,
    Get,
    Create,
    Update,
    Delete,
}

/// A queued manager call.
///
/// `args` stays raw JSON so a worker can still report a failure against
/// `task_id` when the arguments do not decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: Uuid,
    pub model_name: String,
    pub method: TaskMethod,
    pub args: Value,
    /// Identity the worker acts as
    pub principal: Principal,
    /// Caller credential, forwarded if the worker calls a remote service
    #[serde(default)]
    pub credential: Option<String>,
}

/// Result stored for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { value: Value },
    Error { error_detail: ErrorDetail },
}

impl TaskOutcome {
    pub fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(value) => TaskOutcome::Success { value },
            Err(error) => TaskOutcome::Error {
                error_detail: error.detail(),
            },
        }
    }
}

/// Typed form of a task's method and arguments
#[derive(Debug, Clone, PartialEq)]
pub enum TaskCall {
    List(ListQuery),
    Get(Uuid),
    Create(Attributes),
    Update {
        id: Uuid,
        payload: Attributes,
        expected_lsn: Option<i64>,
    },
    Delete(Uuid),
}

#[derive(Deserialize)]
struct IdArgs {
    id: Uuid,
}

#[derive(Deserialize)]
struct CreateArgs {
    payload: Attributes,
}

#[derive(Deserialize)]
struct UpdateArgs {
    id: Uuid,
    payload: Attributes,
    #[serde(default)]
    expected_lsn: Option<i64>,
}

impl TaskCall {
    pub fn method(&self) -> TaskMethod {
        match self {
            TaskCall::List(_) => TaskMethod::List,
            TaskCall::Get(_) => TaskMethod::Get,
            TaskCall::Create(_) => TaskMethod::Create,
            TaskCall::Update { .. } => TaskMethod::Update,
            TaskCall::Delete(_) => TaskMethod::Delete,
        }
    }

    pub fn args(&self) -> Result<Value> {
        Ok(match self {
            TaskCall::List(query) => serde_json::to_value(query)?,
            TaskCall::Get(id) | TaskCall::Delete(id) => json!({ "id": id }),
            TaskCall::Create(payload) => json!({ "payload": payload }),
            TaskCall::Update {
                id,
                payload,
                expected_lsn,
            } => json!({ "id": id, "payload": payload, "expected_lsn": expected_lsn }),
        })
    }

    pub fn from_parts(method: TaskMethod, args: Value) -> Result<Self> {
        let invalid = |e: serde_json::Error| {
            Error::Validation(format!("invalid arguments for {:?}: {}", method, e))
        };
        Ok(match method {
            TaskMethod::List => TaskCall::List(serde_json::from_value(args).map_err(invalid)?),
            TaskMethod::Get => {
                TaskCall::Get(serde_json::from_value::<IdArgs>(args).map_err(invalid)?.id)
            }
            TaskMethod::Delete => {
                TaskCall::Delete(serde_json::from_value::<IdArgs>(args).map_err(invalid)?.id)
            }
            TaskMethod::Create => TaskCall::Create(
                serde_json::from_value::<CreateArgs>(args)
                    .map_err(invalid)?
                    .payload,
            ),
            TaskMethod::Update => {
                let args: UpdateArgs = serde_json::from_value(args).map_err(invalid)?;
                TaskCall::Update {
                    id: args.id,
                    payload: args.payload,
                    expected_lsn: args.expected_lsn,
                }
            }
        })
    }

    /// Run the call and encode its return value
    pub async fn execute(self, manager: &dyn DataAccess) -> Result<Value> {
        Ok(match self {
            TaskCall::List(query) => serde_json::to_value(manager.list(query).await?)?,
            TaskCall::Get(id) => serde_json::to_value(manager.get(id).await?)?,
            TaskCall::Create(payload) => serde_json::to_value(manager.create(payload).await?)?,
            TaskCall::Update {
                id,
                payload,
                expected_lsn,
            } => serde_json::to_value(manager.update(id, payload, expected_lsn).await?)?,
            TaskCall::Delete(id) => {
                manager.delete(id).await?;
                Value::Null
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn outcome_wire_shape() {
        let success = TaskOutcome::Success { value: json!({"id": 1}) };
        assert_eq!(
            serde_json::to_value(&success).unwrap(),
            json!({"status": "success", "value": {"id": 1}})
        );

        let failed = TaskOutcome::from_result(Err(Error::Validation("bad".to_string())));
        let wire = serde_json::to_value(&failed).unwrap();
        assert_eq!(wire["status"], json!("error"));
        assert_eq!(wire["error_detail"]["error"], json!("validation"));
        match serde_json::from_value::<TaskOutcome>(wire).unwrap() {
            TaskOutcome::Error { error_detail } => assert_eq!(error_detail.kind, ErrorKind::Validation),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn update_args_decode_with_optional_lsn() {
        let id = Uuid::new_v4();
        let call = TaskCall::from_parts(
            TaskMethod::Update,
            json!({"id": id, "payload": {"price": 12}}),
        )
        .unwrap();

        match call {
            TaskCall::Update { id: got, expected_lsn, .. } => {
                assert_eq!(got, id);
                assert_eq!(expected_lsn, None);
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn bad_args_are_validation_errors() {
        let err = TaskCall::from_parts(TaskMethod::Get, json!({"id": "nope"})).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
