//! # tw-protocol
//!
//! Wire types for the task-status push channel and the REST status
//! endpoint. Frames are JSON text; see [`decode_frame`] and
//! [`OutboundCommand::encode`].

mod inbound;
mod outbound;
mod status;

pub use inbound::{decode_frame, InboundEvent, SchedulerStatus, TaskUpdate};
pub use outbound::OutboundCommand;
pub use status::{TaskStatus, TaskStatusReport};

/// Server-side task identifier.
pub type TaskId = u64;

/// Default keepalive interval in seconds.
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Maximum accepted text frame size (1 MB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Errors raised while decoding or encoding frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Frame has no `type` field")]
    MissingType,

    #[error("Invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Frame too large ({0} bytes)")]
    TooLarge(usize),

    #[error("Failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),
}
