//! Event-stream protocol.
//!
//! Every frame on the stream is a JSON text envelope
//! `{"event": "<name>", "data": <payload>}`. Inbound and outbound events are
//! separate enums so the type system keeps the two directions apart.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, RecordError};
use crate::types::{
    ChannelId, ConversationId, Message, MessageTarget, TargetFields, TypingEntry, User, UserId,
};

pub const EVENT_MESSAGE_RECEIVED: &str = "message:received";
pub const EVENT_USER_CONNECTED: &str = "user:connected";
pub const EVENT_USER_DISCONNECTED: &str = "user:disconnected";
pub const EVENT_USER_LIST: &str = "user:list";
pub const EVENT_TYPING_UPDATE: &str = "typing:update";

pub const EVENT_USER_JOIN: &str = "user:join";
pub const EVENT_MESSAGE_SEND: &str = "message:send";
pub const EVENT_TYPING_START: &str = "typing:start";
pub const EVENT_TYPING_STOP: &str = "typing:stop";

/// Kinds of inbound event a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageReceived,
    UserConnected,
    UserDisconnected,
    UserList,
    TypingUpdate,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::MessageReceived,
        EventKind::UserConnected,
        EventKind::UserDisconnected,
        EventKind::UserList,
        EventKind::TypingUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageReceived => EVENT_MESSAGE_RECEIVED,
            Self::UserConnected => EVENT_USER_CONNECTED,
            Self::UserDisconnected => EVENT_USER_DISCONNECTED,
            Self::UserList => EVENT_USER_LIST,
            Self::TypingUpdate => EVENT_TYPING_UPDATE,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Inbound (server → client)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum InboundEvent {
    #[serde(rename = "message:received")]
    MessageReceived(Message),

    #[serde(rename = "user:connected")]
    UserConnected(User),

    #[serde(rename = "user:disconnected")]
    UserDisconnected(User),

    /// Presence snapshot. Additive: users absent from it keep their status.
    #[serde(rename = "user:list")]
    UserList(Vec<User>),

    #[serde(rename = "typing:update")]
    TypingUpdate(TypingUpdate),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub is_typing: bool,
}

impl TypingUpdate {
    pub fn entry(&self) -> TypingEntry {
        TypingEntry {
            user_id: self.user_id.clone(),
            channel_id: self.channel_id.clone(),
            conversation_id: self.conversation_id.clone(),
        }
    }
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageReceived(_) => EventKind::MessageReceived,
            Self::UserConnected(_) => EventKind::UserConnected,
            Self::UserDisconnected(_) => EventKind::UserDisconnected,
            Self::UserList(_) => EventKind::UserList,
            Self::TypingUpdate(_) => EventKind::TypingUpdate,
        }
    }

    /// Decode one text frame. Events this client does not know are reported
    /// as [`ProtocolError::UnknownEvent`] rather than a JSON error.
    pub fn from_json(frame: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(frame)?;
        let name = value
            .get("event")
            .and_then(serde_json::Value::as_str)
            .ok_or(ProtocolError::MissingEventName)?;

        if EventKind::from_name(name).is_none() {
            return Err(ProtocolError::UnknownEvent(name.to_string()));
        }

        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Outbound (client → server)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    #[serde(rename = "user:join")]
    Join(User),

    #[serde(rename = "message:send")]
    SendMessage(NewMessage),

    #[serde(rename = "typing:start")]
    TypingStart(TypingEntry),

    #[serde(rename = "typing:stop")]
    TypingStop(TypingEntry),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => EVENT_USER_JOIN,
            Self::SendMessage(_) => EVENT_MESSAGE_SEND,
            Self::TypingStart(_) => EVENT_TYPING_START,
            Self::TypingStop(_) => EVENT_TYPING_STOP,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A message as sent by this client: the server assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "NewMessageWire", into = "NewMessageWire")]
pub struct NewMessage {
    pub content: String,
    pub sender: User,
    pub target: MessageTarget,
}

#[derive(Serialize, Deserialize)]
struct NewMessageWire {
    content: String,
    sender: User,
    #[serde(flatten)]
    target: TargetFields,
}

impl TryFrom<NewMessageWire> for NewMessage {
    type Error = RecordError;

    fn try_from(wire: NewMessageWire) -> Result<Self, Self::Error> {
        Ok(Self {
            content: wire.content,
            sender: wire.sender,
            target: MessageTarget::try_from(wire.target)?,
        })
    }
}

impl From<NewMessage> for NewMessageWire {
    fn from(m: NewMessage) -> Self {
        Self {
            target: TargetFields::from(&m.target),
            content: m.content,
            sender: m.sender,
        }
    }
}

impl From<&Message> for NewMessage {
    fn from(m: &Message) -> Self {
        Self {
            content: m.content.clone(),
            sender: m.sender.clone(),
            target: m.target.clone(),
        }
    }
}
