//! Inbound push frames.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ProtocolError, TaskId, TaskStatus, MAX_FRAME_SIZE};

/// Per-task progress pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub progress: f64,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Any additional keys the server attached to the update.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskUpdate {
    pub fn new(status: impl Into<TaskStatus>, progress: f64) -> Self {
        Self {
            progress,
            status: status.into(),
            downloaded_size: None,
            total_size: None,
            error_message: None,
            extra: Map::new(),
        }
    }
}

/// Global scheduler snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running_tasks: u32,
    pub pending_tasks: u32,
    pub max_concurrent: u32,
    pub scheduler_running: bool,
    pub running_task_ids: Vec<TaskId>,
    pub pending_task_ids: Vec<TaskId>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    TaskUpdate {
        task_id: TaskId,
        update: TaskUpdate,
        timestamp: Option<String>,
    },
    SchedulerStatus(SchedulerStatus),
    Notification(Value),
    SubscriptionAck {
        task_id: Option<TaskId>,
        message: String,
    },
    UnsubscriptionAck {
        task_id: Option<TaskId>,
        message: String,
    },
    Pong {
        timestamp: Option<u64>,
    },
    Error {
        message: String,
    },
    /// A well-formed frame whose `type` this client does not know.
    Unknown {
        kind: String,
    },
}

impl InboundEvent {
    /// Wire tag, for logging.
    pub fn kind(&self) -> &str {
        match self {
            Self::TaskUpdate { .. } => "task_update",
            Self::SchedulerStatus(_) => "scheduler_status",
            Self::Notification(_) => "notification",
            Self::SubscriptionAck { .. } => "subscription_ack",
            Self::UnsubscriptionAck { .. } => "unsubscription_ack",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
            Self::Unknown { kind } => kind,
        }
    }
}

#[derive(Deserialize)]
struct TaskUpdateFrame {
    task_id: TaskId,
    data: TaskUpdate,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct DataFrame<T> {
    data: T,
}

#[derive(Deserialize)]
struct AckFrame {
    #[serde(default)]
    task_id: Option<TaskId>,
    message: String,
}

#[derive(Deserialize)]
struct PongFrame {
    #[serde(default)]
    timestamp: Option<Value>,
}

#[derive(Deserialize)]
struct ErrorFrame {
    message: String,
}

/// Decode a JSON text frame into an [`InboundEvent`].
///
/// Unknown `type` values are not an error; they come back as
/// [`InboundEvent::Unknown`].
pub fn decode_frame(text: &str) -> Result<InboundEvent, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::TooLarge(text.len()));
    }

    let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    let event = match kind.as_str() {
        "task_update" => {
            let frame: TaskUpdateFrame = payload(&kind, value)?;
            InboundEvent::TaskUpdate {
                task_id: frame.task_id,
                update: frame.data,
                timestamp: frame.timestamp,
            }
        }
        "scheduler_status" => {
            let frame: DataFrame<SchedulerStatus> = payload(&kind, value)?;
            InboundEvent::SchedulerStatus(frame.data)
        }
        "notification" => {
            let frame: DataFrame<Value> = payload(&kind, value)?;
            InboundEvent::Notification(frame.data)
        }
        "subscription_ack" | "subscription_confirmed" => {
            let frame: AckFrame = payload(&kind, value)?;
            InboundEvent::SubscriptionAck {
                task_id: frame.task_id,
                message: frame.message,
            }
        }
        "unsubscription_ack" | "unsubscription_confirmed" => {
            let frame: AckFrame = payload(&kind, value)?;
            InboundEvent::UnsubscriptionAck {
                task_id: frame.task_id,
                message: frame.message,
            }
        }
        "pong" => {
            let frame: PongFrame = payload(&kind, value)?;
            InboundEvent::Pong {
                timestamp: frame.timestamp.as_ref().and_then(Value::as_u64),
            }
        }
        "error" => {
            let frame: ErrorFrame = payload(&kind, value)?;
            InboundEvent::Error {
                message: frame.message,
            }
        }
        _ => InboundEvent::Unknown { kind },
    };

    Ok(event)
}

fn payload<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_task_update() {
        let event = decode_frame(
            r#"{"type":"task_update","task_id":42,"timestamp":"2024-05-01T10:00:00",
                "data":{"progress":55.5,"status":"processing","downloaded_size":10,"total_size":20,"speed":"1MB/s"}}"#,
        )
        .unwrap();

        match event {
            InboundEvent::TaskUpdate {
                task_id,
                update,
                timestamp,
            } => {
                assert_eq!(task_id, 42);
                assert_eq!(update.status, TaskStatus::Processing);
                assert_eq!(update.progress, 55.5);
                assert_eq!(update.downloaded_size, Some(10));
                assert_eq!(update.total_size, Some(20));
                assert_eq!(update.extra.get("speed"), Some(&Value::from("1MB/s")));
                assert_eq!(timestamp.as_deref(), Some("2024-05-01T10:00:00"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_scheduler_status() {
        let event = decode_frame(
            r#"{"type":"scheduler_status","data":{"running_tasks":1,"pending_tasks":2,
                "max_concurrent":10,"scheduler_running":true,
                "running_task_ids":[3],"pending_task_ids":[4,5]}}"#,
        )
        .unwrap();

        let InboundEvent::SchedulerStatus(status) = event else {
            panic!("expected scheduler status");
        };
        assert_eq!(status.pending_task_ids, vec![4, 5]);
        assert!(status.scheduler_running);
    }

    #[test]
    fn test_decode_ack_spellings() {
        let confirmed = decode_frame(
            r#"{"type":"subscription_confirmed","task_id":7,"message":"Subscribed to task 7"}"#,
        )
        .unwrap();
        assert_eq!(
            confirmed,
            InboundEvent::SubscriptionAck {
                task_id: Some(7),
                message: "Subscribed to task 7".into()
            }
        );

        let ack = decode_frame(r#"{"type":"unsubscription_ack","message":"ok"}"#).unwrap();
        assert_eq!(
            ack,
            InboundEvent::UnsubscriptionAck {
                task_id: None,
                message: "ok".into()
            }
        );
    }

    #[test]
    fn test_decode_pong_and_error() {
        assert_eq!(
            decode_frame(r#"{"type":"pong","timestamp":1700000000000}"#).unwrap(),
            InboundEvent::Pong {
                timestamp: Some(1_700_000_000_000)
            }
        );
        assert_eq!(
            decode_frame(r#"{"type":"pong"}"#).unwrap(),
            InboundEvent::Pong { timestamp: None }
        );
        assert_eq!(
            decode_frame(r#"{"type":"error","message":"Unknown message type: foo"}"#).unwrap(),
            InboundEvent::Error {
                message: "Unknown message type: foo".into()
            }
        );
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let event = decode_frame(r#"{"type":"agent.status","status":"online"}"#).unwrap();
        assert_eq!(
            event,
            InboundEvent::Unknown {
                kind: "agent.status".into()
            }
        );
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            decode_frame("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_frame(r#"{"task_id":1}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            decode_frame(r#"{"type":"task_update","task_id":"abc","data":{}}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }
}
