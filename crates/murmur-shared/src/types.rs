use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{DEFAULT_AVATAR_URL, GENERATED_AVATAR_BASE};
use crate::error::RecordError;

// Server-assigned identifiers are opaque strings (ObjectIds on the reference
// backend). Each kind gets its own newtype so they cannot be mixed up.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(UserId);
string_id!(ChannelId);
string_id!(
    /// Identity of a direct conversation as shown in the sidebar.
    ConversationId
);
string_id!(
    /// Backing chat session used to retrieve a conversation's history.
    /// Never interchangeable with [`ConversationId`].
    ChatSessionId
);
string_id!(MessageId);

impl MessageId {
    /// Fresh id for a locally created message.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    #[default]
    Offline,
    Away,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    #[serde(alias = "username")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            name: name.into(),
            email: None,
            avatar: None,
            status: PresenceStatus::Offline,
            last_seen: None,
        }
    }

    /// Avatar to display, falling back to the shared default image.
    pub fn avatar_or_default(&self) -> &str {
        self.avatar.as_deref().unwrap_or(DEFAULT_AVATAR_URL)
    }

    /// Fill in the default avatar when none was provided.
    pub fn with_default_avatar(mut self) -> Self {
        if self.avatar.as_deref().map_or(true, str::is_empty) {
            self.avatar = Some(DEFAULT_AVATAR_URL.to_string());
        }
        self
    }

    /// Fill in an avatar generated from the user's name when none was provided.
    pub fn with_generated_avatar(mut self) -> Self {
        if self.avatar.as_deref().map_or(true, str::is_empty) {
            self.avatar = Some(generated_avatar_url(&self.name));
        }
        self
    }
}

pub fn generated_avatar_url(seed: &str) -> String {
    format!("{GENERATED_AVATAR_BASE}?seed={seed}")
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// The single container a message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageTarget {
    Channel(ChannelId),
    Conversation(ConversationId),
}

impl MessageTarget {
    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            Self::Channel(id) => Some(id),
            Self::Conversation(_) => None,
        }
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Channel(_) => None,
            Self::Conversation(id) => Some(id),
        }
    }
}

impl std::fmt::Display for MessageTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(id) => write!(f, "channel:{id}"),
            Self::Conversation(id) => write!(f, "conversation:{id}"),
        }
    }
}

/// Wire form of a [`MessageTarget`]: two optional ids of which exactly one
/// must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

impl TargetFields {
    pub fn is_empty(&self) -> bool {
        self.channel_id.is_none() && self.conversation_id.is_none()
    }
}

impl From<&MessageTarget> for TargetFields {
    fn from(target: &MessageTarget) -> Self {
        Self {
            channel_id: target.channel_id().cloned(),
            conversation_id: target.conversation_id().cloned(),
        }
    }
}

impl TryFrom<TargetFields> for MessageTarget {
    type Error = RecordError;

    fn try_from(fields: TargetFields) -> Result<Self, Self::Error> {
        match (fields.channel_id, fields.conversation_id) {
            (Some(channel), None) => Ok(Self::Channel(channel)),
            (None, Some(conversation)) => Ok(Self::Conversation(conversation)),
            (Some(_), Some(_)) => Err(RecordError::AmbiguousTarget),
            (None, None) => Err(RecordError::MissingTarget),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "MessageWire", into = "MessageWire")]
pub struct Message {
    pub id: MessageId,
    pub content: String,
    pub sender: User,
    pub timestamp: DateTime<Utc>,
    pub target: MessageTarget,
}

#[derive(Serialize, Deserialize)]
struct MessageWire {
    id: MessageId,
    content: String,
    sender: User,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    target: TargetFields,
}

impl TryFrom<MessageWire> for Message {
    type Error = RecordError;

    fn try_from(wire: MessageWire) -> Result<Self, Self::Error> {
        Ok(Self {
            id: wire.id,
            content: wire.content,
            sender: wire.sender,
            timestamp: wire.timestamp,
            target: MessageTarget::try_from(wire.target)?,
        })
    }
}

impl From<Message> for MessageWire {
    fn from(m: Message) -> Self {
        Self {
            target: TargetFields::from(&m.target),
            id: m.id,
            content: m.content,
            sender: m.sender,
            timestamp: m.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub members: Vec<User>,
    /// Authoritative member count; may exceed `members.len()`.
    #[serde(default)]
    pub participant_count: u32,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Channel {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ChannelId::new(id),
            name: name.into(),
            description: None,
            visibility: Visibility::Public,
            members: Vec::new(),
            participant_count: 0,
            messages: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    /// `None` until a chat-session listing has been reconciled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_session_id: Option<ChatSessionId>,
    #[serde(default)]
    pub participants: Vec<User>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, participants: Vec<User>) -> Self {
        Self {
            id: ConversationId::new(id),
            chat_session_id: None,
            participants,
            messages: Vec::new(),
            last_message: None,
        }
    }

    /// One-to-one placeholder seeded from a user listing, keyed by the
    /// user's id.
    pub fn placeholder_for(user: User) -> Self {
        let participant = User {
            status: PresenceStatus::Offline,
            ..user
        }
        .with_generated_avatar();
        Self::new(participant.id.0.clone(), vec![participant])
    }

    pub fn with_chat_session(mut self, session: ChatSessionId) -> Self {
        self.chat_session_id = Some(session);
        self
    }

    /// Replace the message sequence, keeping `last_message` equal to its tail.
    pub fn set_messages(&mut self, messages: Vec<Message>) {
        self.last_message = messages.last().cloned();
        self.messages = messages;
    }

    pub fn push_message(&mut self, message: Message) {
        self.last_message = Some(message.clone());
        self.messages.push(message);
    }
}

// ---------------------------------------------------------------------------
// Typing
// ---------------------------------------------------------------------------

/// Ephemeral "user is composing" marker. Identity is the whole triple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct TypingEntry {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
}

impl TypingEntry {
    pub fn new(user_id: UserId, target: &MessageTarget) -> Self {
        Self {
            user_id,
            channel_id: target.channel_id().cloned(),
            conversation_id: target.conversation_id().cloned(),
        }
    }

    pub fn is_in(&self, target: &MessageTarget) -> bool {
        self.channel_id.as_ref() == target.channel_id()
            && self.conversation_id.as_ref() == target.conversation_id()
    }
}
