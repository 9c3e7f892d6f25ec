use serde::Serialize;

use crate::{ProtocolError, TaskId};

/// Commands the client sends over the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundCommand {
    SubscribeTask { task_id: TaskId },
    UnsubscribeTask { task_id: TaskId },
    GetSchedulerStatus,
    /// Keepalive; `timestamp` is epoch millis and is echoed back in `pong`.
    Ping { timestamp: u64 },
}

impl OutboundCommand {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SubscribeTask { .. } => "subscribe_task",
            Self::UnsubscribeTask { .. } => "unsubscribe_task",
            Self::GetSchedulerStatus => "get_scheduler_status",
            Self::Ping { .. } => "ping",
        }
    }
}
