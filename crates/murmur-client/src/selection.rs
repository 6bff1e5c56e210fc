//! What the user is looking at.
//!
//! [`Selection`] is a single enum, so a channel and a conversation can never
//! be selected at once. [`SelectionController`] is the only writer of the
//! selection in the store and decides which history fetch a change needs.

use murmur_shared::{ChannelId, ChatSessionId, ConversationId, MessageTarget};
use tracing::debug;

use crate::store::Store;
use crate::sync::{FetchKind, FetchRequest, RequestToken, RequestTokens};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Selection {
    #[default]
    None,
    Channel(ChannelId),
    Conversation(ConversationId),
}

impl Selection {
    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            Self::Channel(id) => Some(id),
            _ => None,
        }
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Conversation(id) => Some(id),
            _ => None,
        }
    }

    /// Container new messages go to while this is selected.
    pub fn target(&self) -> Option<MessageTarget> {
        match self {
            Self::None => None,
            Self::Channel(id) => Some(MessageTarget::Channel(id.clone())),
            Self::Conversation(id) => Some(MessageTarget::Conversation(id.clone())),
        }
    }
}

/// A history fetch the selection asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryFetch {
    pub token: RequestToken,
    pub request: FetchRequest,
}

#[derive(Debug, Default)]
pub struct SelectionController {
    tokens: RequestTokens,
}

impl SelectionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show a channel. Channels carry their messages in the listing, so no
    /// fetch is needed; any history fetch still in flight is superseded.
    pub fn select_channel(&mut self, store: &mut Store, id: ChannelId) {
        debug!(channel = %id, "Channel selected");
        self.tokens.invalidate(FetchKind::History);
        store.set_selection(Selection::Channel(id));
    }

    /// Show a conversation and request its history by backing chat session.
    /// A conversation whose session is not known yet is shown without a
    /// fetch.
    pub fn select_conversation(
        &mut self,
        store: &mut Store,
        id: ConversationId,
    ) -> Option<HistoryFetch> {
        debug!(conversation = %id, "Conversation selected");
        store.set_selection(Selection::Conversation(id.clone()));
        self.history_for(store, id)
    }

    pub fn clear(&mut self, store: &mut Store) {
        self.tokens.invalidate(FetchKind::History);
        store.set_selection(Selection::None);
    }

    /// Re-request history for the current selection, e.g. after a reconnect
    /// or once a chat-session listing has attached the backing session.
    pub fn refresh(&mut self, store: &Store) -> Option<HistoryFetch> {
        let id = store.state().selection.conversation_id()?.clone();
        self.history_for(store, id)
    }

    /// Whether a resolved history fetch still belongs to the current
    /// selection.
    pub fn accept_history(&self, token: &RequestToken) -> bool {
        self.tokens.is_current(token)
    }

    fn history_for(&mut self, store: &Store, id: ConversationId) -> Option<HistoryFetch> {
        let session: Option<ChatSessionId> = store
            .state()
            .conversation(&id)
            .and_then(|c| c.chat_session_id.clone());

        let Some(session) = session else {
            self.tokens.invalidate(FetchKind::History);
            debug!(conversation = %id, "No chat session yet, skipping history fetch");
            return None;
        };

        Some(HistoryFetch {
            token: self.tokens.issue(FetchKind::History),
            request: FetchRequest::History {
                session,
                target: MessageTarget::Conversation(id),
            },
        })
    }
}
