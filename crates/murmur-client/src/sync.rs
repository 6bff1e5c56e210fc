//! Fetch orchestration.
//!
//! Fetches run as spawned tasks and report back to the client loop as
//! [`FetchOutcome`]s. Each one carries a [`RequestToken`]; issuing a newer
//! token of the same kind supersedes the older request, so a slow response
//! can never overwrite the result of a newer one.

use std::collections::HashMap;
use std::sync::Arc;

use murmur_net::{ChatApi, NetError};
use murmur_shared::records::ChatSessionRecord;
use murmur_shared::{
    Channel, ChatSessionId, Conversation, Message, MessageTarget, StateError, User, UserId,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKind {
    CurrentUser,
    Channels,
    Users,
    ChatSessions,
    History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestToken {
    kind: FetchKind,
    generation: u64,
}

impl RequestToken {
    pub fn kind(&self) -> FetchKind {
        self.kind
    }
}

/// Generation counters, one per fetch kind.
#[derive(Debug, Default)]
pub struct RequestTokens {
    next: u64,
    current: HashMap<FetchKind, u64>,
}

impl RequestTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token for a new request, superseding any earlier one of the
    /// same kind.
    pub fn issue(&mut self, kind: FetchKind) -> RequestToken {
        self.next += 1;
        self.current.insert(kind, self.next);
        RequestToken {
            kind,
            generation: self.next,
        }
    }

    /// Supersede every outstanding request of `kind` without issuing a new
    /// one.
    pub fn invalidate(&mut self, kind: FetchKind) {
        self.current.remove(&kind);
    }

    pub fn is_current(&self, token: &RequestToken) -> bool {
        self.current.get(&token.kind) == Some(&token.generation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchRequest {
    CurrentUser(UserId),
    Channels,
    Users,
    ChatSessions,
    History {
        session: ChatSessionId,
        target: MessageTarget,
    },
}

impl FetchRequest {
    pub fn kind(&self) -> FetchKind {
        match self {
            Self::CurrentUser(_) => FetchKind::CurrentUser,
            Self::Channels => FetchKind::Channels,
            Self::Users => FetchKind::Users,
            Self::ChatSessions => FetchKind::ChatSessions,
            Self::History { .. } => FetchKind::History,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FetchData {
    CurrentUser(User),
    Channels(Vec<Channel>),
    Users(Vec<User>),
    ChatSessions(Vec<ChatSessionRecord>),
    History {
        target: MessageTarget,
        messages: Vec<Message>,
    },
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub token: RequestToken,
    pub result: Result<FetchData, NetError>,
}

/// Perform one fetch against the API.
pub async fn execute(api: &dyn ChatApi, request: FetchRequest) -> Result<FetchData, NetError> {
    match request {
        FetchRequest::CurrentUser(id) => api.get_user(&id).await.map(FetchData::CurrentUser),
        FetchRequest::Channels => api.list_channels().await.map(FetchData::Channels),
        FetchRequest::Users => api.list_users().await.map(FetchData::Users),
        FetchRequest::ChatSessions => api.list_chat_sessions().await.map(FetchData::ChatSessions),
        FetchRequest::History { session, target } => {
            let messages = api.get_chat_messages(&session, &target).await?;
            Ok(FetchData::History { target, messages })
        }
    }
}

/// Run a fetch in its own task and deliver the outcome to `tx`.
pub fn spawn_fetch(
    api: Arc<dyn ChatApi>,
    token: RequestToken,
    request: FetchRequest,
    tx: mpsc::UnboundedSender<FetchOutcome>,
) {
    tokio::spawn(async move {
        debug!(kind = ?token.kind(), "Fetch started");
        let result = execute(api.as_ref(), request).await;
        if tx.send(FetchOutcome { token, result }).is_err() {
            debug!(kind = ?token.kind(), "Client gone, fetch result dropped");
        }
    });
}

/// Apply a successful fetch to the store.
pub fn apply_fetch(store: &mut Store, data: FetchData) -> Result<(), StateError> {
    match data {
        FetchData::CurrentUser(user) => {
            let id = user.id.clone();
            store.set_current_user(user);
            store.drop_self_placeholder(&id);
        }
        FetchData::Channels(channels) => store.replace_channel_list(channels),
        FetchData::Users(users) => {
            let me = store.state().current_user.as_ref().map(|u| u.id.clone());
            let placeholders = users
                .into_iter()
                .filter(|u| Some(&u.id) != me.as_ref())
                .map(Conversation::placeholder_for)
                .collect();
            store.replace_user_conversations(placeholders);
        }
        FetchData::ChatSessions(records) => {
            let me = store.state().current_user.as_ref().map(|u| u.id.clone());
            let conversations = records
                .into_iter()
                .filter_map(|record| {
                    let id = record.id.clone();
                    match record.into_conversation(me.as_ref()) {
                        Ok(conversation) => Some(conversation),
                        Err(e) => {
                            warn!(session = %id, error = %e, "Skipping malformed chat session");
                            None
                        }
                    }
                })
                .collect();
            store.merge_conversations(conversations);
        }
        FetchData::History { target, messages } => {
            store.set_messages_for_target(&target, messages)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::{ConversationId, PresenceStatus};

    #[test]
    fn test_newer_token_supersedes_older() {
        let mut tokens = RequestTokens::new();
        let first = tokens.issue(FetchKind::Channels);
        let other = tokens.issue(FetchKind::Users);
        let second = tokens.issue(FetchKind::Channels);

        assert!(!tokens.is_current(&first));
        assert!(tokens.is_current(&second));
        assert!(tokens.is_current(&other));

        tokens.invalidate(FetchKind::Channels);
        assert!(!tokens.is_current(&second));
        assert!(tokens.is_current(&other));
    }

    #[test]
    fn test_user_listing_seeds_placeholders_without_self() {
        let mut store = Store::new();
        store.set_current_user(User::new("me", "me"));

        let mut bob = User::new("u2", "bob");
        bob.status = PresenceStatus::Online;
        apply_fetch(
            &mut store,
            FetchData::Users(vec![User::new("me", "me"), bob]),
        )
        .unwrap();

        let state = store.state();
        assert_eq!(state.conversations.len(), 1);
        let conv = &state.conversations[0];
        assert_eq!(conv.id, ConversationId::new("u2"));
        assert_eq!(conv.participants[0].status, PresenceStatus::Offline);
        assert!(conv.participants[0].avatar.as_deref().unwrap().contains("seed=bob"));
    }

    #[test]
    fn test_chat_sessions_attach_to_placeholders() {
        let mut store = Store::new();
        store.set_current_user(User::new("me", "me"));
        apply_fetch(&mut store, FetchData::Users(vec![User::new("u2", "bob")])).unwrap();

        let records: Vec<ChatSessionRecord> = serde_json::from_str(
            r#"[{"id":"S1","participants":[{"id":"me","name":"me"},{"id":"u2","name":"bob"}]},
                {"id":"S2","participants":[{"id":"me","name":"me"},{"id":"u3","name":"eve"}]},
                {"id":"S3","participants":[{"id":"me","name":"me","lastSeen":"whenever"},{"id":"u4","name":"x"}]}]"#,
        )
        .unwrap();
        apply_fetch(&mut store, FetchData::ChatSessions(records)).unwrap();

        let state = store.state();
        assert_eq!(state.conversations.len(), 2);
        assert_eq!(
            state.conversation(&ConversationId::new("u2")).unwrap().chat_session_id,
            Some(ChatSessionId::new("S1"))
        );
        assert_eq!(
            state.conversation(&ConversationId::new("u3")).unwrap().chat_session_id,
            Some(ChatSessionId::new("S2"))
        );
    }

    #[test]
    fn test_listing_refresh_keeps_group_history() {
        let mut store = Store::new();
        store.set_current_user(User::new("me", "me"));
        let users = || FetchData::Users(vec![User::new("u2", "bob"), User::new("u3", "eve")]);
        let sessions = || {
            let records: Vec<ChatSessionRecord> = serde_json::from_str(
                r#"[{"id":"G1","participants":[{"id":"me","name":"me"},{"id":"u2","name":"bob"},{"id":"u3","name":"eve"}]}]"#,
            )
            .unwrap();
            FetchData::ChatSessions(records)
        };

        apply_fetch(&mut store, users()).unwrap();
        apply_fetch(&mut store, sessions()).unwrap();
        let target = MessageTarget::Conversation(ConversationId::new("G1"));
        store
            .append_message(
                Message {
                    id: "g1".into(),
                    content: "hey all".into(),
                    sender: User::new("u2", "bob"),
                    timestamp: chrono::Utc::now(),
                    target: target.clone(),
                },
                crate::store::MessageOrigin::Remote,
            )
            .unwrap();

        apply_fetch(&mut store, users()).unwrap();
        assert_eq!(store.state().messages_for(&target).map(<[Message]>::len), Some(1));

        apply_fetch(&mut store, sessions()).unwrap();
        assert_eq!(store.state().messages_for(&target).map(<[Message]>::len), Some(1));
        assert_eq!(store.state().conversations.len(), 3);
    }

    #[test]
    fn test_current_user_after_listing_drops_self() {
        let mut store = Store::new();
        apply_fetch(
            &mut store,
            FetchData::Users(vec![User::new("me", "me"), User::new("u2", "bob")]),
        )
        .unwrap();
        assert_eq!(store.state().conversations.len(), 2);

        apply_fetch(&mut store, FetchData::CurrentUser(User::new("me", "me"))).unwrap();
        let ids: Vec<&str> = store.state().conversations.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["u2"]);
    }

    #[test]
    fn test_history_for_unknown_target_fails() {
        let mut store = Store::new();
        let target = MessageTarget::Conversation(ConversationId::new("ghost"));
        let err = apply_fetch(
            &mut store,
            FetchData::History {
                target: target.clone(),
                messages: Vec::new(),
            },
        )
        .unwrap_err();
        assert_eq!(err, StateError::UnknownTarget(target));
    }
}
