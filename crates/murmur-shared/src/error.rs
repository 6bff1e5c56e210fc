use thiserror::Error;

use crate::types::{MessageId, MessageTarget};

/// Precondition failures of a state mutation. The state is left untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("No current user: cannot send before the profile is loaded")]
    NoCurrentUser,

    #[error("Duplicate message id: {0}")]
    DuplicateMessage(MessageId),

    #[error("Unknown target: {0}")]
    UnknownTarget(MessageTarget),

    #[error("Message {message} belongs to {actual}, not {expected}")]
    TargetMismatch {
        message: MessageId,
        expected: MessageTarget,
        actual: MessageTarget,
    },
}

/// Malformed data from the fetch API or the event stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Invalid timestamp in `{field}`: {value:?} ({reason})")]
    InvalidTimestamp {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Message names both a channel and a conversation")]
    AmbiguousTarget,

    #[error("Message names neither a channel nor a conversation")]
    MissingTarget,

    #[error("Record {record} belongs to {actual}, expected {expected}")]
    TargetMismatch {
        record: String,
        expected: MessageTarget,
        actual: MessageTarget,
    },
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame has no event name")]
    MissingEventName,

    #[error("Unknown event: {0}")]
    UnknownEvent(String),
}
