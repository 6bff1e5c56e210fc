//! The client event loop.
//!
//! One tokio task owns the [`Store`] and is the only place state changes.
//! It multiplexes four inputs with `tokio::select!`: commands from
//! [`ChatHandle`]s, inbound stream events forwarded by the listener
//! registrations, fetch outcomes from spawned fetch tasks, and connection
//! lifecycle changes. A periodic tick evicts stale typing indicators.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use murmur_net::{ChatApi, ConnectionManager, ConnectionState, Subscription};
use murmur_shared::records::LoginRequest;
use murmur_shared::{
    ChannelId, ConversationId, EventKind, InboundEvent, Message, MessageId, MessageTarget,
    NewMessage, OutboundEvent, StateError, TypingEntry, UserId,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::reconcile;
use crate::selection::{HistoryFetch, SelectionController};
use crate::store::{ChatState, MessageOrigin, Store};
use crate::sync::{self, FetchKind, FetchOutcome, FetchRequest, RequestTokens};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Requests sent *into* the client loop.
#[derive(Debug)]
enum Command {
    SelectChannel(ChannelId),
    SelectConversation(ConversationId),
    ClearSelection,
    SendMessage {
        /// `None` sends to whatever is selected.
        target: Option<MessageTarget>,
        content: String,
        reply: oneshot::Sender<Result<MessageId, ClientError>>,
    },
    StartTyping,
    StopTyping,
    /// Re-run every listing fetch.
    Refresh,
    Shutdown,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap handle to a running client. Cloning shares the same loop; the loop
/// stops when [`ChatHandle::shutdown`] is called or every handle is dropped.
#[derive(Clone)]
pub struct ChatHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<Arc<ChatState>>,
    api: Arc<dyn ChatApi>,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl ChatHandle {
    /// Current snapshot.
    pub fn state(&self) -> Arc<ChatState> {
        self.state_rx.borrow().clone()
    }

    /// Change notifications for rendering.
    pub fn watch(&self) -> watch::Receiver<Arc<ChatState>> {
        self.state_rx.clone()
    }

    pub async fn select_channel(&self, id: impl Into<ChannelId>) -> Result<(), ClientError> {
        self.send(Command::SelectChannel(id.into())).await
    }

    pub async fn select_conversation(&self, id: impl Into<ConversationId>) -> Result<(), ClientError> {
        self.send(Command::SelectConversation(id.into())).await
    }

    pub async fn clear_selection(&self) -> Result<(), ClientError> {
        self.send(Command::ClearSelection).await
    }

    /// Send a message to the current selection. The message shows up in the
    /// store immediately; delivery to the server is best-effort.
    pub async fn send_message(&self, content: impl Into<String>) -> Result<MessageId, ClientError> {
        self.send_message_inner(None, content.into()).await
    }

    pub async fn send_message_to(
        &self,
        target: MessageTarget,
        content: impl Into<String>,
    ) -> Result<MessageId, ClientError> {
        self.send_message_inner(Some(target), content.into()).await
    }

    async fn send_message_inner(
        &self,
        target: Option<MessageTarget>,
        content: String,
    ) -> Result<MessageId, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SendMessage {
            target,
            content,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    pub async fn start_typing(&self) -> Result<(), ClientError> {
        self.send(Command::StartTyping).await
    }

    pub async fn stop_typing(&self) -> Result<(), ClientError> {
        self.send(Command::StopTyping).await
    }

    pub async fn refresh(&self) -> Result<(), ClientError> {
        self.send(Command::Refresh).await
    }

    /// Exchange credentials for a session token. Does not touch client state.
    pub async fn login(
        &self,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<String, ClientError> {
        let credentials = LoginRequest {
            email: email.into(),
            password: password.into(),
        };
        Ok(self.api.login(&credentials).await?)
    }

    /// Stop the loop, release its listener registrations, and wait for it
    /// to finish.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Client task failed");
            }
        }
    }

    async fn send(&self, cmd: Command) -> Result<(), ClientError> {
        self.cmd_tx.send(cmd).await.map_err(|_| ClientError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Client loop
// ---------------------------------------------------------------------------

pub struct ChatClient {
    store: Store,
    selection: SelectionController,
    tokens: RequestTokens,
    api: Arc<dyn ChatApi>,
    connection: ConnectionManager,
    user_id: Option<UserId>,
    typing_timeout: Duration,
    fetch_tx: mpsc::UnboundedSender<FetchOutcome>,
    /// Epoch of the live connection, if any.
    connected_epoch: Option<u64>,
    /// Epoch the `user:join` was last sent on.
    joined_epoch: Option<u64>,
    users_loaded: bool,
    sessions_requested: bool,
    subscriptions: Vec<Subscription>,
}

impl ChatClient {
    /// Start the client loop. `connection` is the process-wide connection;
    /// the client registers its listeners on it and starts it if needed.
    pub fn spawn(config: ClientConfig, connection: ConnectionManager, api: Arc<dyn ChatApi>) -> ChatHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(256);
        // Unbounded so a busy loop never loses a stream event.
        let (event_tx, event_rx) = mpsc::unbounded_channel::<InboundEvent>();
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel::<FetchOutcome>();

        let subscriptions = EventKind::ALL
            .into_iter()
            .map(|kind| {
                let tx = event_tx.clone();
                connection.subscribe(kind, move |event| {
                    if tx.send(event.clone()).is_err() {
                        debug!(event = %event.kind(), "Client stopped, event not forwarded");
                    }
                })
            })
            .collect();

        let store = Store::new();
        let state_rx = store.subscribe();

        let client = ChatClient {
            store,
            selection: SelectionController::new(),
            tokens: RequestTokens::new(),
            api: api.clone(),
            connection: connection.clone(),
            user_id: config.user_id.clone(),
            typing_timeout: config.typing_timeout,
            fetch_tx,
            connected_epoch: None,
            joined_epoch: None,
            users_loaded: false,
            sessions_requested: false,
            subscriptions,
        };

        let conn_state = connection.watch_state();
        connection.connect();

        let task = tokio::spawn(client.run(cmd_rx, event_rx, fetch_rx, conn_state));

        ChatHandle {
            cmd_tx,
            state_rx,
            api,
            task: Arc::new(std::sync::Mutex::new(Some(task))),
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut event_rx: mpsc::UnboundedReceiver<InboundEvent>,
        mut fetch_rx: mpsc::UnboundedReceiver<FetchOutcome>,
        mut conn_state: watch::Receiver<ConnectionState>,
    ) {
        info!(user = ?self.user_id, "Client started");
        self.fetch_listings();

        let initial = *conn_state.borrow_and_update();
        if let ConnectionState::Connected { epoch } = initial {
            self.on_connected(epoch);
        }

        let mut typing_tick = tokio::time::interval(eviction_period(self.typing_timeout));
        typing_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut conn_open = true;

        loop {
            tokio::select! {
                // --- Commands from handles ---
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },

                // --- Stream events ---
                Some(event) = event_rx.recv() => self.handle_event(&event),

                // --- Fetch results ---
                Some(outcome) = fetch_rx.recv() => self.handle_fetch(outcome),

                // --- Connection lifecycle ---
                changed = conn_state.changed(), if conn_open => {
                    if changed.is_err() {
                        conn_open = false;
                        continue;
                    }
                    let state = *conn_state.borrow_and_update();
                    match state {
                        ConnectionState::Connected { epoch } => self.on_connected(epoch),
                        ConnectionState::Connecting | ConnectionState::Disconnected => {
                            if self.connected_epoch.take().is_some() {
                                info!("Stream connection lost");
                            }
                        }
                    }
                }

                // --- Typing eviction ---
                _ = typing_tick.tick() => {
                    self.store.evict_stale_typing(Instant::now(), self.typing_timeout);
                }
            }
        }

        let released = self.subscriptions.len();
        self.subscriptions.clear();
        info!(listeners_released = released, "Client stopped");
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SelectChannel(id) => self.selection.select_channel(&mut self.store, id),
            Command::SelectConversation(id) => {
                let fetch = self.selection.select_conversation(&mut self.store, id);
                self.start_history(fetch);
            }
            Command::ClearSelection => self.selection.clear(&mut self.store),
            Command::SendMessage {
                target,
                content,
                reply,
            } => {
                let result = self.send_message(target, content);
                if let Err(e) = &result {
                    warn!(error = %e, "Send rejected");
                }
                let _ = reply.send(result);
            }
            Command::StartTyping => self.emit_typing(true),
            Command::StopTyping => self.emit_typing(false),
            Command::Refresh => {
                self.users_loaded = false;
                self.sessions_requested = false;
                self.fetch_listings();
            }
            Command::Shutdown => {}
        }
    }

    /// Optimistically append a message from the current user, then emit it.
    fn send_message(
        &mut self,
        target: Option<MessageTarget>,
        content: String,
    ) -> Result<MessageId, ClientError> {
        let sender = self
            .store
            .state()
            .current_user
            .as_deref()
            .cloned()
            .ok_or(StateError::NoCurrentUser)?;
        let target = target
            .or_else(|| self.store.state().selection.target())
            .ok_or(ClientError::NoSelection)?;

        let message = Message {
            id: MessageId::generate(),
            content,
            sender,
            timestamp: Utc::now(),
            target,
        };
        let id = message.id.clone();
        let outbound = OutboundEvent::SendMessage(NewMessage::from(&message));

        self.store.append_message(message, MessageOrigin::Local)?;

        // The local copy stays even if the stream cannot take the event.
        if let Err(e) = self.connection.emit(&outbound) {
            warn!(message = %id, error = %e, "Message kept locally but not sent");
        }
        Ok(id)
    }

    fn emit_typing(&mut self, typing: bool) {
        let state = self.store.state();
        let (Some(me), Some(target)) = (state.current_user.as_ref(), state.selection.target()) else {
            debug!("Typing indicator needs a current user and a selection");
            return;
        };

        let entry = TypingEntry::new(me.id.clone(), &target);
        let event = if typing {
            OutboundEvent::TypingStart(entry)
        } else {
            OutboundEvent::TypingStop(entry)
        };
        if let Err(e) = self.connection.emit(&event) {
            debug!(error = %e, "Typing indicator not sent");
        }
    }

    // -----------------------------------------------------------------------
    // Stream events
    // -----------------------------------------------------------------------

    fn handle_event(&mut self, event: &InboundEvent) {
        match reconcile::apply_event(&mut self.store, event, Instant::now()) {
            Ok(()) => {}
            Err(StateError::DuplicateMessage(id)) => {
                debug!(message = %id, "Ignoring already known message");
            }
            Err(e) => warn!(event = %event.kind(), error = %e, "Stream event not applied"),
        }
    }

    fn on_connected(&mut self, epoch: u64) {
        let reconnect = self.joined_epoch.is_some() || epoch > 1;
        self.connected_epoch = Some(epoch);
        info!(epoch, "Stream connected");
        self.try_join();

        if reconnect {
            debug!(epoch, "Reconnected, resyncing");
            self.fetch(FetchRequest::Channels);
            let fetch = self.selection.refresh(&self.store);
            self.start_history(fetch);
        }
    }

    /// Announce the current user on the live connection, once per epoch.
    fn try_join(&mut self) {
        let Some(epoch) = self.connected_epoch else {
            return;
        };
        if self.joined_epoch == Some(epoch) {
            return;
        }
        let Some(me) = self.store.state().current_user.as_deref().cloned() else {
            return;
        };

        match self.connection.emit(&OutboundEvent::Join(me)) {
            Ok(()) => {
                self.joined_epoch = Some(epoch);
                debug!(epoch, "Join sent");
            }
            Err(e) => warn!(epoch, error = %e, "Join not sent"),
        }
    }

    // -----------------------------------------------------------------------
    // Fetches
    // -----------------------------------------------------------------------

    fn fetch_listings(&mut self) {
        match self.user_id.clone() {
            Some(id) => self.fetch(FetchRequest::CurrentUser(id)),
            None => warn!("No user id configured, running without a current user"),
        }
        self.fetch(FetchRequest::Channels);
        self.fetch(FetchRequest::Users);
    }

    fn fetch(&mut self, request: FetchRequest) {
        let token = self.tokens.issue(request.kind());
        sync::spawn_fetch(self.api.clone(), token, request, self.fetch_tx.clone());
    }

    fn start_history(&mut self, fetch: Option<HistoryFetch>) {
        if let Some(HistoryFetch { token, request }) = fetch {
            sync::spawn_fetch(self.api.clone(), token, request, self.fetch_tx.clone());
        }
    }

    /// Chat sessions map onto conversations relative to the current user,
    /// so they are only requested once both the user and the user listing
    /// are in.
    fn maybe_fetch_sessions(&mut self) {
        if self.sessions_requested
            || !self.users_loaded
            || self.store.state().current_user.is_none()
        {
            return;
        }
        self.sessions_requested = true;
        self.fetch(FetchRequest::ChatSessions);
    }

    fn handle_fetch(&mut self, outcome: FetchOutcome) {
        let FetchOutcome { token, result } = outcome;
        let kind = token.kind();

        let current = match kind {
            FetchKind::History => self.selection.accept_history(&token),
            _ => self.tokens.is_current(&token),
        };
        if !current {
            debug!(?kind, "Discarding superseded fetch result");
            return;
        }

        let data = match result {
            Ok(data) => data,
            Err(e) => {
                error!(?kind, error = %e, "Fetch failed, keeping previous state");
                if kind == FetchKind::ChatSessions {
                    self.sessions_requested = false;
                }
                return;
            }
        };

        if let Err(e) = sync::apply_fetch(&mut self.store, data) {
            warn!(?kind, error = %e, "Fetch result not applied");
            return;
        }
        debug!(?kind, "Fetch applied");

        match kind {
            FetchKind::CurrentUser => {
                self.try_join();
                self.maybe_fetch_sessions();
            }
            FetchKind::Users => {
                self.users_loaded = true;
                self.maybe_fetch_sessions();
            }
            FetchKind::ChatSessions => {
                // The selected conversation may only now have a session.
                let needs_history = self
                    .store
                    .state()
                    .selection
                    .conversation_id()
                    .and_then(|id| self.store.state().conversation(id))
                    .is_some_and(|c| c.messages.is_empty() && c.chat_session_id.is_some());
                if needs_history {
                    let fetch = self.selection.refresh(&self.store);
                    self.start_history(fetch);
                }
            }
            FetchKind::Channels | FetchKind::History => {}
        }
    }
}

/// Tick often enough that an entry outlives its timeout by at most a
/// fraction of it.
fn eviction_period(timeout: Duration) -> Duration {
    (timeout / 4).max(Duration::from_millis(100))
}
