//! The shared event-stream connection.
//!
//! One [`ConnectionManager`] exists per process. It is constructed
//! explicitly by the application root and handed (cloned) to whoever needs
//! it; there is no global instance. The connection itself runs in a
//! dedicated tokio task that owns the transport link, reconnects with
//! exponential backoff, and dispatches decoded inbound events to the
//! registered listeners.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use murmur_shared::constants::{
    DEFAULT_RECONNECT_MAX_MS, DEFAULT_RECONNECT_MIN_MS, OUTBOUND_QUEUE_CAPACITY,
};
use murmur_shared::{EventKind, InboundEvent, OutboundEvent, ProtocolError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::NetError;
use crate::listeners::{lock_registry, Handler, ListenerRegistry, Subscription};
use crate::transport::Connector;

/// Lifecycle of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// `epoch` counts successful connections since construction; anything
    /// above 1 is a reconnect.
    Connected { epoch: u64 },
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Outbound events buffered while the link is down.
    pub outbound_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_min: Duration::from_millis(DEFAULT_RECONNECT_MIN_MS),
            reconnect_max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            outbound_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

/// Exponential backoff between reconnect attempts: doubles up to `max`,
/// back to `min` after a successful connection.
#[derive(Debug, Clone)]
struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.min;
    }
}

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<mpsc::Receiver<String>>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    registry: Arc<Mutex<ListenerRegistry>>,
    outbound_tx: Mutex<mpsc::Sender<String>>,
    /// Held here whenever no connection task is running.
    outbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    state_tx: watch::Sender<ConnectionState>,
    /// Successful connections so far. Survives disconnect/connect cycles so
    /// a restarted task never reports a fresh first connect.
    epoch: AtomicU64,
    running: Mutex<Option<Running>>,
}

/// Handle to the process-wide event-stream connection. Cloning is cheap and
/// every clone refers to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                registry: Arc::new(Mutex::new(ListenerRegistry::new())),
                outbound_tx: Mutex::new(outbound_tx),
                outbound_rx: Mutex::new(Some(outbound_rx)),
                state_tx,
                epoch: AtomicU64::new(0),
                running: Mutex::new(None),
            }),
        }
    }

    /// Start the connection task. Calling this while already running is a
    /// no-op. Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut running = lock(&self.shared.running);
        if running.is_some() {
            debug!("Connection already started");
            return;
        }

        let Some(outbound_rx) = lock(&self.shared.outbound_rx).take() else {
            error!("Outbound queue missing, cannot start connection");
            return;
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let shared = self.shared.clone();
        let task = tokio::spawn(connection_loop(shared, outbound_rx, shutdown_rx));

        *running = Some(Running {
            shutdown: shutdown_tx,
            task,
        });
        info!("Connection task started");
    }

    /// Tear the connection down. Every listener registration is dropped, so
    /// outstanding [`Subscription`]s become inert, and queued outbound events
    /// are discarded.
    pub async fn disconnect(&self) {
        let running = lock(&self.shared.running).take();

        if let Some(Running { shutdown, task }) = running {
            let _ = shutdown.send(());
            match task.await {
                Ok(mut outbound_rx) => {
                    let mut discarded = 0usize;
                    while outbound_rx.try_recv().is_ok() {
                        discarded += 1;
                    }
                    if discarded > 0 {
                        debug!(discarded, "Discarded unsent outbound events");
                    }
                    *lock(&self.shared.outbound_rx) = Some(outbound_rx);
                }
                Err(e) => {
                    error!(error = %e, "Connection task failed, recreating outbound queue");
                    let (tx, rx) = mpsc::channel(self.shared.config.outbound_capacity.max(1));
                    *lock(&self.shared.outbound_tx) = tx;
                    *lock(&self.shared.outbound_rx) = Some(rx);
                }
            }
        }

        let dropped = lock_registry(&self.shared.registry).clear();
        self.shared.state_tx.send_replace(ConnectionState::Disconnected);
        info!(listeners_dropped = dropped, "Disconnected");
    }

    /// Register `handler` for one inbound event kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let id = lock_registry(&self.shared.registry).insert(kind, handler);
        debug!(event = %kind, "Listener registered");
        Subscription::new(kind, id, &self.shared.registry)
    }

    /// Queue one outbound event. Fire-and-forget: success only means the
    /// event was queued, not that the server received it. While the link is
    /// down events wait in a bounded queue; once it is full they are dropped.
    pub fn emit(&self, event: &OutboundEvent) -> Result<(), NetError> {
        let frame = event.to_json()?;
        let result = lock(&self.shared.outbound_tx).try_send(frame);
        match result {
            Ok(()) => {
                debug!(event = event.name(), "Outbound event queued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = event.name(), "Outbound queue full, dropping event");
                Err(NetError::QueueFull(event.name()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(NetError::Closed),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        lock_registry(&self.shared.registry).len()
    }
}

/// Deliver one inbound frame to the listeners registered for its kind.
fn dispatch(registry: &Mutex<ListenerRegistry>, frame: &str) {
    let event = match InboundEvent::from_json(frame) {
        Ok(event) => event,
        Err(ProtocolError::UnknownEvent(name)) => {
            debug!(event = %name, "Ignoring unknown event");
            return;
        }
        Err(e) => {
            warn!(error = %e, len = frame.len(), "Dropping malformed frame");
            return;
        }
    };

    let kind = event.kind();
    let handlers = lock_registry(registry).handlers_for(kind);
    debug!(event = %kind, listeners = handlers.len(), "Dispatching inbound event");
    for handler in handlers {
        handler(&event);
    }
}

enum LinkEnd {
    Shutdown,
    Lost,
}

async fn connection_loop(
    shared: Arc<Shared>,
    mut outbound: mpsc::Receiver<String>,
    mut shutdown: oneshot::Receiver<()>,
) -> mpsc::Receiver<String> {
    let mut backoff = Backoff::new(shared.config.reconnect_min, shared.config.reconnect_max);

    loop {
        shared.state_tx.send_replace(ConnectionState::Connecting);

        let attempt = tokio::select! {
            _ = &mut shutdown => break,
            result = shared.connector.connect() => result,
        };

        let link = match attempt {
            Ok(link) => link,
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Connection attempt failed");
                shared.state_tx.send_replace(ConnectionState::Disconnected);
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        backoff.reset();
        let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        shared.state_tx.send_replace(ConnectionState::Connected { epoch });
        info!(epoch, "Connected");

        let mut sink = link.sink;
        let mut stream = link.stream;

        let end = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    if let Err(e) = sink.close().await {
                        debug!(error = %e, "Error closing link");
                    }
                    break LinkEnd::Shutdown;
                }

                Some(frame) = outbound.recv() => {
                    if let Err(e) = sink.send(frame).await {
                        warn!(error = %e, "Send failed, outbound event lost");
                        break LinkEnd::Lost;
                    }
                }

                incoming = stream.next() => match incoming {
                    Some(Ok(frame)) => dispatch(&shared.registry, &frame),
                    Some(Err(e)) => {
                        warn!(error = %e, "Link error");
                        break LinkEnd::Lost;
                    }
                    None => {
                        info!("Link closed by server");
                        break LinkEnd::Lost;
                    }
                },
            }
        };

        if let LinkEnd::Shutdown = end {
            break;
        }

        shared.state_tx.send_replace(ConnectionState::Disconnected);
        let delay = backoff.next_delay();
        info!(retry_in_ms = delay.as_millis() as u64, "Connection lost, reconnecting");
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.state_tx.send_replace(ConnectionState::Disconnected);
    info!("Connection task terminated");
    outbound
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use futures::channel::mpsc as fmpsc;
    use murmur_shared::{PresenceStatus, User};

    use crate::transport::Link;

    /// Server side of an in-memory link.
    struct ServerEnd {
        to_client: fmpsc::UnboundedSender<Result<String, NetError>>,
        from_client: fmpsc::UnboundedReceiver<String>,
    }

    fn memory_link() -> (Link, ServerEnd) {
        let (to_client, client_rx) = fmpsc::unbounded();
        let (client_tx, from_client) = fmpsc::unbounded();
        let link = Link::new(client_tx.sink_map_err(|_| NetError::Closed), client_rx);
        (
            link,
            ServerEnd {
                to_client,
                from_client,
            },
        )
    }

    #[derive(Default)]
    struct FakeConnector {
        links: Mutex<VecDeque<Link>>,
        attempts: AtomicUsize,
    }

    impl FakeConnector {
        fn with_links(links: Vec<Link>) -> Arc<Self> {
            Arc::new(Self {
                links: Mutex::new(links.into()),
                attempts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self) -> Result<Link, NetError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            lock(&self.links).pop_front().ok_or(NetError::Closed)
        }
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            reconnect_min: Duration::from_millis(5),
            reconnect_max: Duration::from_millis(20),
            outbound_capacity: 4,
        }
    }

    async fn wait_connected(manager: &ConnectionManager, epoch: u64) {
        let mut rx = manager.watch_state();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| *s == ConnectionState::Connected { epoch }),
        )
        .await
        .expect("timed out waiting for connection")
        .expect("state channel closed");
    }

    fn user_connected_frame(id: &str) -> String {
        InboundEvent::UserConnected(User::new(id, id)).to_json().unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_to_subscriber() {
        let (link, server) = memory_link();
        let manager = ConnectionManager::new(FakeConnector::with_links(vec![link]), fast_config());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = manager.subscribe(EventKind::UserConnected, move |event| {
            let _ = tx.send(event.clone());
        });

        manager.connect();
        wait_connected(&manager, 1).await;

        server.to_client.unbounded_send(Ok(user_connected_frame("u1"))).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, InboundEvent::UserConnected(User::new("u1", "u1")));
    }

    #[tokio::test]
    async fn test_independent_unsubscribe() {
        let (link, server) = memory_link();
        let manager = ConnectionManager::new(FakeConnector::with_links(vec![link]), fast_config());

        let (tx_a, mut rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = tokio::sync::mpsc::unbounded_channel();
        let sub_a = manager.subscribe(EventKind::UserConnected, move |e| {
            let _ = tx_a.send(e.clone());
        });
        let _sub_b = manager.subscribe(EventKind::UserConnected, move |e| {
            let _ = tx_b.send(e.clone());
        });
        assert_eq!(manager.listener_count(), 2);

        sub_a.unsubscribe();
        assert_eq!(manager.listener_count(), 1);

        manager.connect();
        wait_connected(&manager, 1).await;
        server.to_client.unbounded_send(Ok(user_connected_frame("u2"))).unwrap();

        assert!(tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .unwrap()
            .is_some());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (link, _server) = memory_link();
        let connector = FakeConnector::with_links(vec![link]);
        let manager = ConnectionManager::new(connector.clone(), fast_config());

        manager.connect();
        manager.connect();
        wait_connected(&manager, 1).await;
        manager.connect();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_emit_before_connect_is_buffered() {
        let (link, mut server) = memory_link();
        let manager = ConnectionManager::new(FakeConnector::with_links(vec![link]), fast_config());

        let mut jane = User::new("u1", "jane");
        jane.status = PresenceStatus::Online;
        manager.emit(&OutboundEvent::Join(jane.clone())).unwrap();

        manager.connect();
        let frame = tokio::time::timeout(Duration::from_secs(2), server.from_client.next())
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "user:join");
        assert_eq!(value["data"]["id"], "u1");
    }

    #[tokio::test]
    async fn test_emit_drops_when_queue_full() {
        let manager = ConnectionManager::new(FakeConnector::with_links(vec![]), fast_config());
        let join = OutboundEvent::Join(User::new("u1", "jane"));

        for _ in 0..4 {
            manager.emit(&join).unwrap();
        }
        assert!(matches!(manager.emit(&join), Err(NetError::QueueFull("user:join"))));
    }

    #[tokio::test]
    async fn test_reconnects_after_link_loss() {
        let (first, server_one) = memory_link();
        let (second, server_two) = memory_link();
        let connector = FakeConnector::with_links(vec![first, second]);
        let manager = ConnectionManager::new(connector.clone(), fast_config());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = manager.subscribe(EventKind::UserConnected, move |e| {
            let _ = tx.send(e.clone());
        });

        manager.connect();
        wait_connected(&manager, 1).await;

        drop(server_one);
        wait_connected(&manager, 2).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);

        // Listeners survive a reconnect.
        server_two.to_client.unbounded_send(Ok(user_connected_frame("u3"))).unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_disconnect_invalidates_listeners() {
        let (link, _server) = memory_link();
        let manager = ConnectionManager::new(FakeConnector::with_links(vec![link]), fast_config());
        let sub = manager.subscribe(EventKind::TypingUpdate, |_| {});

        manager.connect();
        wait_connected(&manager, 1).await;
        manager.disconnect().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.listener_count(), 0);
        assert!(!sub.is_active());
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let (link, server) = memory_link();
        let manager = ConnectionManager::new(FakeConnector::with_links(vec![link]), fast_config());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = manager.subscribe(EventKind::UserConnected, move |e| {
            let _ = tx.send(e.clone());
        });

        manager.connect();
        wait_connected(&manager, 1).await;

        server.to_client.unbounded_send(Ok("{garbage".to_string())).unwrap();
        server
            .to_client
            .unbounded_send(Ok(r#"{"event":"server:hello","data":{}}"#.to_string()))
            .unwrap();
        server.to_client.unbounded_send(Ok(user_connected_frame("u4"))).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind(), EventKind::UserConnected);
        assert_eq!(manager.state(), ConnectionState::Connected { epoch: 1 });
    }

    #[test]
    fn test_backoff_doubles_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
