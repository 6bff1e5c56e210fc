//! Records returned by the data-fetch API and their mapping into the
//! domain model.
//!
//! The API is loose about field names (`id` vs `_id`, `name` vs `username`,
//! `createdAt` vs `timestamp`) and sometimes wraps payloads in an
//! `{ data, status, message }` envelope. All of that is absorbed here so the
//! rest of the client only sees [`crate::types`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RecordError;
use crate::types::{
    Channel, ChannelId, ChatSessionId, Conversation, ConversationId, Message, MessageId,
    MessageTarget, PresenceStatus, TargetFields, User, UserId, Visibility,
};

/// A payload that is either bare or wrapped in the API's response envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Payload<T> {
    Wrapped(ApiEnvelope<T>),
    Bare(T),
}

impl<T> Payload<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Wrapped(envelope) => envelope.data,
            Self::Bare(data) => data,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub data: T,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Parse an RFC 3339 instant as sent by the API.
pub fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, RecordError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RecordError::InvalidTimestamp {
            field,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(alias = "username")]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub status: Option<PresenceStatus>,
    #[serde(default)]
    pub last_seen: Option<String>,
}

impl UserRecord {
    pub fn into_user(self) -> Result<User, RecordError> {
        let last_seen = self
            .last_seen
            .as_deref()
            .map(|s| parse_timestamp("lastSeen", s))
            .transpose()?;

        Ok(User {
            id: UserId(self.id),
            name: self.name,
            email: self.email,
            avatar: self.avatar.filter(|a| !a.is_empty()),
            status: self.status.unwrap_or_default(),
            last_seen,
        })
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    #[serde(alias = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub members: Option<Vec<UserRecord>>,
    #[serde(default)]
    pub participant_count: Option<u32>,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
}

impl ChannelRecord {
    /// Map into a [`Channel`], messages included. Missing members become an
    /// empty list; a missing participant count falls back to the number of
    /// listed members. One bad message fails the whole channel.
    pub fn into_channel(self) -> Result<Channel, RecordError> {
        let id = ChannelId(self.id);
        let target = MessageTarget::Channel(id.clone());
        let messages = self
            .messages
            .into_iter()
            .map(|m| m.into_message(&target))
            .collect::<Result<Vec<_>, _>>()?;

        let members = self
            .members
            .unwrap_or_default()
            .into_iter()
            .map(UserRecord::into_user)
            .collect::<Result<Vec<_>, _>>()?;

        let participant_count = self
            .participant_count
            .unwrap_or(members.len() as u32);

        Ok(Channel {
            id,
            name: self.name,
            description: self.description,
            visibility: self.visibility,
            members,
            participant_count,
            messages,
        })
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(alias = "_id")]
    pub id: String,
    pub content: String,
    pub sender: UserRecord,
    #[serde(alias = "timestamp")]
    pub created_at: String,
    #[serde(flatten)]
    pub target: TargetFields,
}

impl MessageRecord {
    /// Map into a [`Message`] stored under `target`. History records usually
    /// carry no target of their own; when they do it must agree.
    pub fn into_message(self, target: &MessageTarget) -> Result<Message, RecordError> {
        if !self.target.is_empty() {
            let actual = MessageTarget::try_from(self.target)?;
            if &actual != target {
                return Err(RecordError::TargetMismatch {
                    record: self.id,
                    expected: target.clone(),
                    actual,
                });
            }
        }

        Ok(Message {
            timestamp: parse_timestamp("createdAt", &self.created_at)?,
            sender: self.sender.into_user()?,
            id: MessageId(self.id),
            content: self.content,
            target: target.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Chat sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSessionRecord {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub participants: Vec<UserRecord>,
}

impl ChatSessionRecord {
    /// Map a chat session to the conversation it backs.
    ///
    /// A one-to-one session is keyed by the other participant's id so it
    /// lines up with the placeholders seeded from the user listing; any
    /// other session is keyed by its own id.
    pub fn into_conversation(self, me: Option<&UserId>) -> Result<Conversation, RecordError> {
        let participants = self
            .participants
            .into_iter()
            .map(UserRecord::into_user)
            .collect::<Result<Vec<_>, _>>()?;

        let others: Vec<&User> = participants
            .iter()
            .filter(|p| Some(&p.id) != me)
            .collect();

        let id = match others.as_slice() {
            [other] => ConversationId(other.id.0.clone()),
            _ => ConversationId(self.id.clone()),
        };

        Ok(Conversation {
            id,
            chat_session_id: Some(ChatSessionId(self.id)),
            participants,
            messages: Vec::new(),
            last_message: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_unwraps_envelope() {
        let wrapped: Payload<Vec<UserRecord>> = serde_json::from_str(
            r#"{"data":[{"_id":"u1","username":"jane"}],"status":200,"message":"ok"}"#,
        )
        .unwrap();
        let bare: Payload<Vec<UserRecord>> =
            serde_json::from_str(r#"[{"id":"u1","name":"jane"}]"#).unwrap();

        assert_eq!(wrapped.into_inner()[0].id, "u1");
        assert_eq!(bare.into_inner()[0].name, "jane");
    }

    #[test]
    fn test_channel_record_defaults() {
        let record: ChannelRecord =
            serde_json::from_str(r#"{"id":"c1","name":"general","type":"private"}"#).unwrap();
        let channel = record.into_channel().unwrap();

        assert_eq!(channel.visibility, Visibility::Private);
        assert!(channel.members.is_empty());
        assert_eq!(channel.participant_count, 0);
        assert!(channel.messages.is_empty());
    }

    #[test]
    fn test_channel_participant_count_is_authoritative() {
        let record: ChannelRecord = serde_json::from_str(
            r#"{"id":"c1","name":"general","members":[{"id":"u1","name":"a"}],"participantCount":40}"#,
        )
        .unwrap();
        let channel = record.into_channel().unwrap();
        assert_eq!(channel.members.len(), 1);
        assert_eq!(channel.participant_count, 40);
    }

    #[test]
    fn test_channel_record_carries_messages() {
        let record: ChannelRecord = serde_json::from_str(
            r#"{"id":"c1","name":"general","messages":[
                {"_id":"m1","content":"a","sender":{"id":"u1","name":"a"},"createdAt":"2024-12-08T10:00:00Z"},
                {"_id":"m2","content":"b","sender":{"id":"u2","name":"b"},"createdAt":"2024-12-08T10:01:00Z","channelId":"c1"}
            ]}"#,
        )
        .unwrap();
        let channel = record.into_channel().unwrap();

        let ids: Vec<&str> = channel.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2"]);
        assert!(channel
            .messages
            .iter()
            .all(|m| m.target == MessageTarget::Channel("c1".into())));
    }

    #[test]
    fn test_channel_record_rejects_bad_message() {
        let record: ChannelRecord = serde_json::from_str(
            r#"{"id":"c1","name":"general","messages":[
                {"id":"m1","content":"a","sender":{"id":"u1","name":"a"},"createdAt":"2024-12-08T10:00:00Z","channelId":"c9"}
            ]}"#,
        )
        .unwrap();
        assert!(matches!(
            record.into_channel(),
            Err(RecordError::TargetMismatch { .. })
        ));
    }

    #[test]
    fn test_message_record_parses_created_at() {
        let record: MessageRecord = serde_json::from_str(
            r#"{"id":"m1","content":"yo","sender":{"id":"u1","name":"a"},"createdAt":"2024-12-08T10:00:00+01:00"}"#,
        )
        .unwrap();
        let target = MessageTarget::Conversation("d1".into());
        let msg = record.into_message(&target).unwrap();

        assert_eq!(msg.timestamp, parse_timestamp("t", "2024-12-08T09:00:00Z").unwrap());
        assert_eq!(msg.target, target);
    }

    #[test]
    fn test_message_record_bad_timestamp() {
        let record: MessageRecord = serde_json::from_str(
            r#"{"id":"m1","content":"yo","sender":{"id":"u1","name":"a"},"createdAt":"yesterday"}"#,
        )
        .unwrap();
        let err = record
            .into_message(&MessageTarget::Channel("c1".into()))
            .unwrap_err();
        assert!(matches!(err, RecordError::InvalidTimestamp { field: "createdAt", .. }));
    }

    #[test]
    fn test_message_record_target_mismatch() {
        let record: MessageRecord = serde_json::from_str(
            r#"{"id":"m1","content":"yo","sender":{"id":"u1","name":"a"},"createdAt":"2024-12-08T10:00:00Z","channelId":"c2"}"#,
        )
        .unwrap();
        let err = record
            .into_message(&MessageTarget::Channel("c1".into()))
            .unwrap_err();
        assert!(matches!(err, RecordError::TargetMismatch { .. }));
    }

    #[test]
    fn test_chat_session_keys_one_to_one_by_other_user() {
        let record: ChatSessionRecord = serde_json::from_str(
            r#"{"id":"S1","participants":[{"id":"me","name":"me"},{"id":"u2","name":"bob"}]}"#,
        )
        .unwrap();
        let me = UserId::new("me");
        let conv = record.into_conversation(Some(&me)).unwrap();

        assert_eq!(conv.id, ConversationId::new("u2"));
        assert_eq!(conv.chat_session_id, Some(ChatSessionId::new("S1")));
    }

    #[test]
    fn test_chat_session_group_keyed_by_session() {
        let record: ChatSessionRecord = serde_json::from_str(
            r#"{"id":"S2","participants":[{"id":"me","name":"me"},{"id":"u2","name":"b"},{"id":"u3","name":"c"}]}"#,
        )
        .unwrap();
        let conv = record.into_conversation(Some(&UserId::new("me"))).unwrap();
        assert_eq!(conv.id, ConversationId::new("S2"));
    }
}
