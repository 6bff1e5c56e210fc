//! The client's single source of truth.
//!
//! [`Store`] owns a [`ChatState`] and publishes an immutable snapshot through
//! a `watch` channel after every mutation that changed something. Every
//! mutation replaces the substructures it touches with fresh `Arc`s and
//! leaves the rest shared with the previous snapshot, so a renderer can use
//! `Arc::ptr_eq` to tell what changed.
//!
//! The store is not shared between tasks: it is owned by the client event
//! loop and mutated only there.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use murmur_shared::{
    Channel, ChannelId, Conversation, ConversationId, Message, MessageId, MessageTarget,
    PresenceStatus, StateError, TypingEntry, User, UserId,
};
use tokio::sync::watch;
use tracing::debug;

use crate::selection::Selection;

/// Where an appended message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    /// Optimistic copy of a message this client is sending.
    Local,
    /// Delivered by the event stream.
    Remote,
}

/// Immutable snapshot of everything the client knows.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    pub channels: Arc<Vec<Arc<Channel>>>,
    pub conversations: Arc<Vec<Arc<Conversation>>>,
    pub current_user: Option<Arc<User>>,
    pub selection: Selection,
    /// Last presence seen per user, including users not loaded anywhere yet.
    pub presence: Arc<HashMap<UserId, PresenceStatus>>,
    pub typing: Arc<BTreeSet<TypingEntry>>,
}

impl ChatState {
    pub fn channel(&self, id: &ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|c| &c.id == id).map(Arc::as_ref)
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|c| &c.id == id)
            .map(Arc::as_ref)
    }

    pub fn messages_for(&self, target: &MessageTarget) -> Option<&[Message]> {
        match target {
            MessageTarget::Channel(id) => self.channel(id).map(|c| c.messages.as_slice()),
            MessageTarget::Conversation(id) => {
                self.conversation(id).map(|c| c.messages.as_slice())
            }
        }
    }

    /// Messages of whatever is selected; empty when nothing is.
    pub fn selected_messages(&self) -> &[Message] {
        self.selection
            .target()
            .and_then(|t| self.messages_for(&t))
            .unwrap_or(&[])
    }

    /// Users currently typing in `target`.
    pub fn typing_in<'a>(&'a self, target: &'a MessageTarget) -> impl Iterator<Item = &'a UserId> {
        self.typing
            .iter()
            .filter(move |e| e.is_in(target))
            .map(|e| &e.user_id)
    }

    pub fn presence_of(&self, user_id: &UserId) -> Option<PresenceStatus> {
        self.presence.get(user_id).copied()
    }
}

pub struct Store {
    state: ChatState,
    tx: watch::Sender<Arc<ChatState>>,
    /// When each typing entry was last started, for timeout eviction.
    typing_seen: HashMap<TypingEntry, Instant>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let state = ChatState::default();
        let (tx, _) = watch::channel(Arc::new(state.clone()));
        Self {
            state,
            tx,
            typing_seen: HashMap::new(),
        }
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    /// Last published snapshot.
    pub fn snapshot(&self) -> Arc<ChatState> {
        self.tx.borrow().clone()
    }

    /// Change notifications: the receiver sees a new snapshot after every
    /// effective mutation.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ChatState>> {
        self.tx.subscribe()
    }

    fn publish(&self) {
        self.tx.send_replace(Arc::new(self.state.clone()));
    }

    // -----------------------------------------------------------------------
    // Current user and selection
    // -----------------------------------------------------------------------

    pub fn set_current_user(&mut self, user: User) {
        let user = user.with_default_avatar();
        debug!(user = %user.id, "Current user set");
        self.state.current_user = Some(Arc::new(user));
        self.publish();
    }

    pub(crate) fn set_selection(&mut self, selection: Selection) {
        if self.state.selection == selection {
            return;
        }
        self.state.selection = selection;
        self.publish();
    }

    // -----------------------------------------------------------------------
    // Listings
    // -----------------------------------------------------------------------

    /// Replace the channel list with a fetch result. A channel's messages
    /// come from the listing; messages already held that the listing lacks
    /// and that are not older than its last one are kept after it. A listing
    /// without messages leaves the loaded ones alone.
    pub fn replace_channel_list(&mut self, channels: Vec<Channel>) {
        let mut loaded: HashMap<ChannelId, Arc<Channel>> = self
            .state
            .channels
            .iter()
            .filter(|c| !c.messages.is_empty())
            .map(|c| (c.id.clone(), c.clone()))
            .collect();

        let merged: Vec<Arc<Channel>> = channels
            .into_iter()
            .map(|mut channel| {
                if let Some(prior) = loaded.remove(&channel.id) {
                    let listed = std::mem::take(&mut channel.messages);
                    channel.messages = merge_history(listed, &prior.messages);
                }
                apply_known_presence(&self.state.presence, &mut channel.members);
                Arc::new(channel)
            })
            .collect();

        debug!(count = merged.len(), "Channel list replaced");
        self.state.channels = Arc::new(merged);
        self.publish();
    }

    /// Replace the conversation list with a fetch result, merging by id.
    pub fn replace_conversation_list(&mut self, conversations: Vec<Conversation>) {
        let mut existing: HashMap<ConversationId, Arc<Conversation>> = self
            .state
            .conversations
            .iter()
            .map(|c| (c.id.clone(), c.clone()))
            .collect();

        let merged: Vec<Arc<Conversation>> = conversations
            .into_iter()
            .map(|incoming| {
                let prior = existing.remove(&incoming.id);
                Arc::new(self.merge_conversation(prior.as_deref(), incoming))
            })
            .collect();

        debug!(count = merged.len(), "Conversation list replaced");
        self.state.conversations = Arc::new(merged);
        self.publish();
    }

    /// Seed one-to-one placeholders from a user listing. The listing is
    /// authoritative for placeholders only: conversations backed by a chat
    /// session stay, messages included, even when it does not name them.
    pub fn replace_user_conversations(&mut self, placeholders: Vec<Conversation>) {
        let listed: HashSet<ConversationId> = placeholders.iter().map(|c| c.id.clone()).collect();
        let kept: Vec<Conversation> = self
            .state
            .conversations
            .iter()
            .filter(|c| c.chat_session_id.is_some() && !listed.contains(&c.id))
            .map(|c| Conversation::clone(c))
            .collect();

        if !kept.is_empty() {
            debug!(kept = kept.len(), "Keeping session conversations absent from user listing");
        }
        let mut conversations = placeholders;
        conversations.extend(kept);
        self.replace_conversation_list(conversations);
    }

    /// Drop the placeholder seeded for `user_id` itself, if the user listing
    /// was applied before the current user was known.
    pub fn drop_self_placeholder(&mut self, user_id: &UserId) -> bool {
        let is_self_placeholder = |c: &Arc<Conversation>| {
            c.id.as_str() == user_id.as_str()
                && c.chat_session_id.is_none()
                && c.messages.is_empty()
                && c.participants.iter().all(|p| &p.id == user_id)
        };
        if !self.state.conversations.iter().any(is_self_placeholder) {
            return false;
        }

        let list: Vec<Arc<Conversation>> = self
            .state
            .conversations
            .iter()
            .filter(|c| !is_self_placeholder(*c))
            .cloned()
            .collect();
        debug!(user = %user_id, "Self placeholder removed");
        self.state.conversations = Arc::new(list);
        self.publish();
        true
    }

    /// Merge conversations into the list without removing any: matching ids
    /// are updated in place, new ones are appended.
    pub fn merge_conversations(&mut self, conversations: Vec<Conversation>) {
        if conversations.is_empty() {
            return;
        }

        let mut list = (*self.state.conversations).clone();
        for incoming in conversations {
            match list.iter().position(|c| c.id == incoming.id) {
                Some(idx) => {
                    let merged = self.merge_conversation(Some(list[idx].as_ref()), incoming);
                    list[idx] = Arc::new(merged);
                }
                None => list.push(Arc::new(self.merge_conversation(None, incoming))),
            }
        }

        debug!(count = list.len(), "Conversations merged");
        self.state.conversations = Arc::new(list);
        self.publish();
    }

    fn merge_conversation(&self, prior: Option<&Conversation>, mut incoming: Conversation) -> Conversation {
        if let Some(prior) = prior {
            if !prior.messages.is_empty() {
                incoming.set_messages(prior.messages.clone());
            }
            if incoming.chat_session_id.is_none() {
                incoming.chat_session_id = prior.chat_session_id.clone();
            }
        }
        apply_known_presence(&self.state.presence, &mut incoming.participants);
        incoming
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Append one message to the container it names.
    pub fn append_message(&mut self, message: Message, origin: MessageOrigin) -> Result<(), StateError> {
        if origin == MessageOrigin::Local && self.state.current_user.is_none() {
            return Err(StateError::NoCurrentUser);
        }

        let target = message.target.clone();
        if self.state.messages_for(&target).is_none() {
            return Err(StateError::UnknownTarget(target));
        }

        // Ids are unique across every container, not just the target.
        if self.holds_message(&message.id) {
            return Err(StateError::DuplicateMessage(message.id));
        }

        debug!(message = %message.id, target = %target, ?origin, "Message appended");
        match &target {
            MessageTarget::Channel(id) => {
                self.update_channel(id, |c| c.messages.push(message));
            }
            MessageTarget::Conversation(id) => {
                self.update_conversation(id, |c| c.push_message(message));
            }
        }
        self.publish();
        Ok(())
    }

    /// Replace a container's messages with a history fetch, in the order
    /// given.
    ///
    /// Messages already held that the fetch does not contain and that are
    /// not older than its last message arrived while the fetch was in flight;
    /// they are kept after the fetched ones.
    pub fn set_messages_for_target(
        &mut self,
        target: &MessageTarget,
        messages: Vec<Message>,
    ) -> Result<(), StateError> {
        let existing = self
            .state
            .messages_for(target)
            .ok_or_else(|| StateError::UnknownTarget(target.clone()))?;

        if let Some(stray) = messages.iter().find(|m| &m.target != target) {
            return Err(StateError::TargetMismatch {
                message: stray.id.clone(),
                expected: target.clone(),
                actual: stray.target.clone(),
            });
        }

        let merged = merge_history(messages, existing);

        debug!(target = %target, count = merged.len(), "Messages replaced");
        match target {
            MessageTarget::Channel(id) => {
                self.update_channel(id, |c| c.messages = merged);
            }
            MessageTarget::Conversation(id) => {
                self.update_conversation(id, |c| c.set_messages(merged));
            }
        }
        self.publish();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    /// Set a user's presence everywhere the user appears. Returns whether
    /// anything changed.
    pub fn update_user_presence(&mut self, user_id: &UserId, status: PresenceStatus) -> bool {
        self.apply_presence(user_id, status, None)
    }

    /// Like [`Store::update_user_presence`], also recording when the user
    /// was last seen.
    pub fn apply_presence(
        &mut self,
        user_id: &UserId,
        status: PresenceStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> bool {
        let update = |u: &mut User| {
            u.status = status;
            if last_seen.is_some() {
                u.last_seen = last_seen;
            }
        };
        let needs_update = |u: &User| {
            &u.id == user_id && (u.status != status || (last_seen.is_some() && u.last_seen != last_seen))
        };

        let mut changed = false;

        if self.state.presence.get(user_id) != Some(&status) {
            let mut presence = (*self.state.presence).clone();
            presence.insert(user_id.clone(), status);
            self.state.presence = Arc::new(presence);
            changed = true;
        }

        if self.state.channels.iter().any(|c| c.members.iter().any(needs_update)) {
            let channels = self
                .state
                .channels
                .iter()
                .map(|c| {
                    if c.members.iter().any(needs_update) {
                        let mut c = Channel::clone(c);
                        c.members.iter_mut().filter(|m| &m.id == user_id).for_each(update);
                        Arc::new(c)
                    } else {
                        c.clone()
                    }
                })
                .collect();
            self.state.channels = Arc::new(channels);
            changed = true;
        }

        if self
            .state
            .conversations
            .iter()
            .any(|c| c.participants.iter().any(needs_update))
        {
            let conversations = self
                .state
                .conversations
                .iter()
                .map(|c| {
                    if c.participants.iter().any(needs_update) {
                        let mut c = Conversation::clone(c);
                        c.participants.iter_mut().filter(|p| &p.id == user_id).for_each(update);
                        Arc::new(c)
                    } else {
                        c.clone()
                    }
                })
                .collect();
            self.state.conversations = Arc::new(conversations);
            changed = true;
        }

        if let Some(me) = self.state.current_user.as_deref().filter(|u| needs_update(u)) {
            let mut me = me.clone();
            update(&mut me);
            self.state.current_user = Some(Arc::new(me));
            changed = true;
        }

        if changed {
            debug!(user = %user_id, ?status, "Presence updated");
            self.publish();
        }
        changed
    }

    // -----------------------------------------------------------------------
    // Typing
    // -----------------------------------------------------------------------

    pub fn add_typing_entry(&mut self, entry: TypingEntry) -> bool {
        self.add_typing_entry_at(entry, Instant::now())
    }

    /// Add a typing entry, or refresh its eviction clock if already present.
    /// Returns whether the set changed.
    pub fn add_typing_entry_at(&mut self, entry: TypingEntry, now: Instant) -> bool {
        self.typing_seen.insert(entry.clone(), now);
        if self.state.typing.contains(&entry) {
            return false;
        }
        let mut typing = (*self.state.typing).clone();
        typing.insert(entry);
        self.state.typing = Arc::new(typing);
        self.publish();
        true
    }

    /// Remove a typing entry. Removing an absent entry is a no-op.
    pub fn remove_typing_entry(&mut self, entry: &TypingEntry) -> bool {
        self.typing_seen.remove(entry);
        if !self.state.typing.contains(entry) {
            return false;
        }
        let mut typing = (*self.state.typing).clone();
        typing.remove(entry);
        self.state.typing = Arc::new(typing);
        self.publish();
        true
    }

    /// Drop typing entries not refreshed within `timeout` of `now`.
    pub fn evict_stale_typing(&mut self, now: Instant, timeout: Duration) -> Vec<TypingEntry> {
        let stale: Vec<TypingEntry> = self
            .state
            .typing
            .iter()
            .filter(|e| {
                self.typing_seen
                    .get(*e)
                    .map_or(true, |seen| now.saturating_duration_since(*seen) >= timeout)
            })
            .cloned()
            .collect();

        if stale.is_empty() {
            return stale;
        }

        let mut typing = (*self.state.typing).clone();
        for entry in &stale {
            typing.remove(entry);
            self.typing_seen.remove(entry);
        }
        self.state.typing = Arc::new(typing);
        debug!(evicted = stale.len(), "Stale typing entries evicted");
        self.publish();
        stale
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn holds_message(&self, id: &MessageId) -> bool {
        self.state
            .channels
            .iter()
            .any(|c| c.messages.iter().any(|m| &m.id == id))
            || self
                .state
                .conversations
                .iter()
                .any(|c| c.messages.iter().any(|m| &m.id == id))
    }

    fn update_channel(&mut self, id: &ChannelId, f: impl FnOnce(&mut Channel)) -> bool {
        let Some(idx) = self.state.channels.iter().position(|c| &c.id == id) else {
            return false;
        };
        let mut list = (*self.state.channels).clone();
        let mut channel = Channel::clone(&list[idx]);
        f(&mut channel);
        list[idx] = Arc::new(channel);
        self.state.channels = Arc::new(list);
        true
    }

    fn update_conversation(&mut self, id: &ConversationId, f: impl FnOnce(&mut Conversation)) -> bool {
        let Some(idx) = self.state.conversations.iter().position(|c| &c.id == id) else {
            return false;
        };
        let mut list = (*self.state.conversations).clone();
        let mut conversation = Conversation::clone(&list[idx]);
        f(&mut conversation);
        list[idx] = Arc::new(conversation);
        self.state.conversations = Arc::new(list);
        true
    }
}

/// Fetched history in the order given, duplicates dropped, followed by the
/// held messages it lacks that are not older than its last message.
fn merge_history(fetched: Vec<Message>, existing: &[Message]) -> Vec<Message> {
    let mut seen = HashSet::new();
    let mut merged: Vec<Message> = fetched
        .into_iter()
        .filter(|m| seen.insert(m.id.clone()))
        .collect();

    let cutoff: Option<DateTime<Utc>> = merged.last().map(|m| m.timestamp);
    let tail: Vec<Message> = existing
        .iter()
        .filter(|m| !seen.contains(&m.id))
        .filter(|m| cutoff.map_or(true, |t| m.timestamp >= t))
        .cloned()
        .collect();

    if !tail.is_empty() {
        debug!(kept = tail.len(), "Keeping messages newer than history");
    }
    merged.extend(tail);
    merged
}

fn apply_known_presence(presence: &HashMap<UserId, PresenceStatus>, users: &mut [User]) {
    for user in users {
        if let Some(status) = presence.get(&user.id) {
            user.status = *status;
        }
    }
}
