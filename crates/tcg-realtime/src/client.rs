//! User-facing realtime client.
//!
//! [`RealtimeClient`] owns the connection lifecycle: it opens a transport
//! against the configured endpoints, reconnects with exponential backoff
//! when the transport drops, queues outbound messages while no transport is
//! open and replays them on reconnection.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::mpsc, task::AbortHandle};
use tracing::{debug, error, info, warn};

use crate::{
    batcher::{BatchSink, MessageBatcher},
    codec,
    config::{BatchConfig, ClientConfig, Endpoint},
    connection::{Outgoing, connection_task},
    dedup::ProcessedIds,
    error::{TransportError, TransportResult},
    message::{Envelope, InboundMessage, MessageType, OutboundMessage, Priority},
    pending::{PendingQueue, QueuedMessage},
    reconnect::Backoff,
    router::{CacheInvalidator, EventRouter, NoopInvalidator},
    state::{ConnectionState, StateMachine},
    subscription::Subscription,
    transport::{
        ABNORMAL_CLOSURE, ConnectionEpoch, Connector, FrameSink, FrameStream, NORMAL_CLOSURE,
        TungsteniteConnector,
    },
    types::{MessageId, RoomId},
};

/// Read-only view of the state that survives reconnects.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectionSnapshot {
    pub state: ConnectionState,
    pub attempt: u32,
    pub game_room_id: Option<RoomId>,
    pub collaborative_room_id: Option<RoomId>,
    pub pending_messages: Vec<QueuedMessage>,
    pub last_message_id: Option<MessageId>,
}

/// Cross-disconnect session state.
struct Session {
    epoch: ConnectionEpoch,
    /// Consecutive abnormal closes since the last successful open.
    attempt: u32,
    writer: Option<mpsc::UnboundedSender<Outgoing>>,
    reconnect_timer: Option<AbortHandle>,
    queue: PendingQueue,
    sent: ProcessedIds,
    game_room_id: Option<RoomId>,
    collaborative_room_id: Option<RoomId>,
    last_message_id: Option<MessageId>,
}

impl Session {
    fn new(config: &ClientConfig) -> Self {
        Self {
            epoch: ConnectionEpoch::default(),
            attempt: 0,
            writer: None,
            reconnect_timer: None,
            queue: PendingQueue::new(config.max_pending_messages),
            sent: ProcessedIds::new(config.max_processed_ids, config.processed_ids_eviction_ratio),
            game_room_id: None,
            collaborative_room_id: None,
            last_message_id: None,
        }
    }

    /// Hand `envelopes` to the open transport as one frame, or queue them.
    fn transmit(&mut self, mut envelopes: Vec<Envelope>, batch: &BatchConfig) {
        envelopes.retain(|e| !self.sent.contains(&e.id));
        if envelopes.is_empty() {
            return;
        }

        if let Some(writer) = &self.writer {
            let frame = match codec::encode(&envelopes, batch) {
                Ok(frame) => frame,
                Err(err) => {
                    error!(error = %err, count = envelopes.len(), "Dropping unencodable messages");
                    return;
                }
            };
            for envelope in &envelopes {
                self.sent.track(envelope.id.clone());
            }
            match writer.send(Outgoing::Frame { frame, envelopes }) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    envelopes = match returned {
                        Outgoing::Frame { envelopes, .. } => envelopes,
                        Outgoing::Close => Vec::new(),
                    };
                    for envelope in &envelopes {
                        self.sent.forget(&envelope.id);
                    }
                    self.writer = None;
                }
            }
        }

        for envelope in envelopes {
            self.queue.enqueue(envelope.message, envelope.id);
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }
}

/// Why a connection attempt ended without a live transport.
#[derive(Clone, Debug)]
enum AttemptError {
    /// Every endpoint failed to open.
    Unreachable(String),
    /// The session was reset by `disconnect` while the attempt ran.
    Superseded,
    /// The attempt task itself died.
    Aborted(String),
}

impl From<AttemptError> for TransportError {
    fn from(err: AttemptError) -> Self {
        match err {
            AttemptError::Unreachable(reason) => TransportError::connect_failed(reason),
            AttemptError::Superseded => TransportError::connection_closed(Some(
                "Connection attempt superseded by disconnect".to_string(),
            )),
            AttemptError::Aborted(reason) => TransportError::internal(reason),
        }
    }
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), AttemptError>>>;

enum AfterClose {
    Stay,
    Retry { attempt: u32, delay: std::time::Duration },
    GiveUp { attempt: u32 },
}

struct ClientInner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    state: StateMachine,
    session: Mutex<Session>,
    router: EventRouter,
    batcher: MessageBatcher,
    in_flight: Mutex<Option<(u64, ConnectAttempt)>>,
    next_attempt: AtomicU64,
}

/// Routes flushed batches back into the owning client.
struct SessionSink {
    client: Weak<ClientInner>,
}

impl BatchSink for SessionSink {
    fn flush(&self, _priority: Priority, envelopes: Vec<Envelope>) {
        if let Some(inner) = self.client.upgrade() {
            inner.transmit(envelopes);
        }
    }
}

impl ClientInner {
    fn transmit(&self, envelopes: Vec<Envelope>) {
        self.session.lock().transmit(envelopes, &self.config.batch);
    }

    /// Join the running connection attempt or start a new one.
    fn start_attempt(self: &Arc<Self>, manual: bool) -> ConnectAttempt {
        let mut in_flight = self.in_flight.lock();
        if let Some((_, attempt)) = in_flight.as_ref() {
            return attempt.clone();
        }
        if self.state.state().is_connected() {
            return future::ready(Ok(())).boxed().shared();
        }

        let (epoch, recovering) = {
            let mut session = self.session.lock();
            let recovering = manual && self.state.state().is_failed();
            if manual {
                session.cancel_timer();
            }
            if recovering {
                session.attempt = 0;
            }
            (session.epoch, recovering)
        };

        let id = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            if recovering {
                info!("Manual reconnect after retries were exhausted");
                inner.state.set_state(ConnectionState::Reconnecting, 0);
            }
            let result = inner.establish(epoch).await;
            let mut in_flight = inner.in_flight.lock();
            if in_flight.as_ref().is_some_and(|(current, _)| *current == id) {
                *in_flight = None;
            }
            result
        });

        let attempt = async move {
            task.await
                .unwrap_or_else(|err| Err(AttemptError::Aborted(err.to_string())))
        }
        .boxed()
        .shared();
        *in_flight = Some((id, attempt.clone()));
        attempt
    }

    /// Probe every endpoint in order; install the first that opens.
    async fn establish(self: &Arc<Self>, epoch: ConnectionEpoch) -> Result<(), AttemptError> {
        let mut failures = Vec::with_capacity(self.config.endpoints.len());

        for endpoint in &self.config.endpoints {
            debug!(endpoint = %endpoint, "Probing endpoint");
            let opened =
                tokio::time::timeout(self.config.probe_timeout, self.connector.connect(endpoint))
                    .await
                    .unwrap_or_else(|_| Err(TransportError::timeout(self.config.probe_timeout)));
            match opened {
                Ok((sink, stream)) => return self.install(epoch, endpoint, sink, stream),
                Err(err) => {
                    warn!(endpoint = %endpoint, error = %err, "Endpoint unavailable");
                    failures.push(format!("{endpoint}: {err}"));
                }
            }
        }

        let reason = failures.join("; ");
        self.handle_close(epoch, ABNORMAL_CLOSURE, Some(reason.clone()), Vec::new());
        Err(AttemptError::Unreachable(reason))
    }

    fn install(
        self: &Arc<Self>,
        expected: ConnectionEpoch,
        endpoint: &Endpoint,
        sink: FrameSink,
        stream: FrameStream,
    ) -> Result<(), AttemptError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (epoch, replayed) = {
            let mut session = self.session.lock();
            if session.epoch != expected {
                debug!(endpoint = %endpoint, "Discarding transport opened for a reset session");
                return Err(AttemptError::Superseded);
            }
            session.epoch = ConnectionEpoch(expected.0.wrapping_add(1));
            session.attempt = 0;
            session.cancel_timer();
            session.writer = Some(tx);

            // Replay before releasing the lock so later sends cannot overtake.
            let queued = session.queue.drain_in_order();
            let replayed = queued.len();
            for entry in queued {
                session.transmit(vec![entry.into_envelope()], &self.config.batch);
            }
            (session.epoch, replayed)
        };

        info!(endpoint = %endpoint, replayed, "Connected");
        self.state.set_state(ConnectionState::Connected, 0);
        if self.session.lock().epoch != epoch {
            // Disconnected while observers ran.
            self.state.set_state(ConnectionState::Disconnected, 0);
            return Err(AttemptError::Superseded);
        }

        self.spawn_connection(epoch, sink, stream, rx);
        Ok(())
    }

    fn spawn_connection(
        self: &Arc<Self>,
        epoch: ConnectionEpoch,
        sink: FrameSink,
        stream: FrameStream,
        mut commands: mpsc::UnboundedReceiver<Outgoing>,
    ) {
        let router = self.router.clone();
        let client = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(closed) = connection_task(&router, &mut commands, sink, stream).await else {
                debug!(epoch = epoch.0, "Connection closed by client");
                return;
            };
            if let Some(inner) = client.upgrade() {
                inner.handle_close(epoch, closed.code, closed.reason, closed.unsent);
            }
        });
    }

    /// React to the end of a transport (or of a failed attempt).
    fn handle_close(
        self: &Arc<Self>,
        epoch: ConnectionEpoch,
        code: u16,
        reason: Option<String>,
        unsent: Vec<Envelope>,
    ) {
        let (previous, next) = {
            let mut session = self.session.lock();
            if session.epoch != epoch {
                debug!(epoch = epoch.0, "Ignoring close of stale connection");
                return;
            }
            session.writer = None;

            if !unsent.is_empty() {
                warn!(count = unsent.len(), "Re-queueing messages that were not written");
            }
            for envelope in unsent {
                session.sent.forget(&envelope.id);
                session.queue.enqueue(envelope.message, envelope.id);
            }
            // Messages still waiting for a batch were sent before anything
            // that arrives from now on, so they queue first.
            for envelope in self.batcher.drain() {
                session.queue.enqueue(envelope.message, envelope.id);
            }

            let previous = session.attempt;
            let next = if code == NORMAL_CLOSURE {
                AfterClose::Stay
            } else {
                session.attempt = session.attempt.saturating_add(1);
                if session.attempt >= self.config.max_reconnect_attempts {
                    AfterClose::GiveUp {
                        attempt: session.attempt,
                    }
                } else {
                    AfterClose::Retry {
                        attempt: session.attempt,
                        delay: Backoff::from_config(&self.config).delay(session.attempt),
                    }
                }
            };
            (previous, next)
        };

        // Every abnormal close, including a failed retry, passes through
        // `Disconnected` so observers see each new attempt number.
        self.state.set_state(ConnectionState::Disconnected, previous);
        match next {
            AfterClose::Stay => info!(code, reason = ?reason, "Connection closed"),
            AfterClose::GiveUp { attempt } => {
                error!(attempts = attempt, reason = ?reason, "Reconnection attempts exhausted");
                self.state.set_state(ConnectionState::Failed, attempt);
            }
            AfterClose::Retry { attempt, delay } => {
                info!(
                    code,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = ?reason,
                    "Connection lost, scheduling reconnect"
                );
                self.state.set_state(ConnectionState::Reconnecting, attempt);
                self.schedule_reconnect(epoch, delay);
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, epoch: ConnectionEpoch, delay: std::time::Duration) {
        let client = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = client.upgrade() {
                inner.reconnect_due(epoch);
            }
        });

        let mut session = self.session.lock();
        if session.epoch == epoch {
            session.cancel_timer();
            session.reconnect_timer = Some(timer.abort_handle());
        } else {
            timer.abort();
        }
    }

    fn reconnect_due(self: &Arc<Self>, epoch: ConnectionEpoch) {
        {
            let mut session = self.session.lock();
            if session.epoch != epoch {
                return;
            }
            session.reconnect_timer = None;
        }
        if self.state.state() != ConnectionState::Reconnecting {
            return;
        }
        debug!(attempt = self.state.attempt(), "Reconnect timer fired");
        // The attempt runs in its own task; nothing here needs its result.
        drop(self.start_attempt(false));
    }
}

/// Reconnecting WebSocket client.
///
/// The client is cheap to clone and can be shared across tasks. All clones
/// drive the same connection.
///
/// # Example
///
/// ```rust,ignore
/// let config = ClientConfig::new(Endpoint::new(Scheme::Wss, "play.example.com"));
/// let client = RealtimeClient::new(config)?;
///
/// let _state = client.on_connection_state_change(|state, attempt| {
///     println!("{state} (attempt {attempt})");
/// });
/// client.connect().await?;
///
/// client.send(OutboundMessage::ChatMessage {
///     room_id: RoomId::new("lobby"),
///     content: "gg".into(),
/// });
/// ```
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

/// Builder for [`RealtimeClient`] with non-default collaborators.
pub struct RealtimeClientBuilder {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    invalidator: Arc<dyn CacheInvalidator>,
}

impl RealtimeClientBuilder {
    /// Use a custom transport connector.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Use a cache invalidator for inbound state-changing events.
    #[must_use]
    pub fn cache_invalidator(mut self, invalidator: impl CacheInvalidator) -> Self {
        self.invalidator = Arc::new(invalidator);
        self
    }

    /// Validate the configuration and create the client. No connection is
    /// opened until [`RealtimeClient::connect`] is called.
    pub fn build(self) -> TransportResult<RealtimeClient> {
        self.config.validate().map_err(TransportError::config)?;
        let Self {
            config,
            connector,
            invalidator,
        } = self;

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let sink = Arc::new(SessionSink {
                client: weak.clone(),
            });
            ClientInner {
                connector,
                state: StateMachine::new(),
                session: Mutex::new(Session::new(&config)),
                router: EventRouter::new(
                    invalidator,
                    ProcessedIds::new(config.max_processed_ids, config.processed_ids_eviction_ratio),
                    config.max_message_size,
                ),
                batcher: MessageBatcher::new(config.batch.clone(), sink),
                in_flight: Mutex::new(None),
                next_attempt: AtomicU64::new(0),
                config,
            }
        });

        info!(endpoints = inner.config.endpoints.len(), "Realtime client created");
        Ok(RealtimeClient { inner })
    }
}

impl RealtimeClient {
    /// Create a client using the `tokio-tungstenite` transport and no cache
    /// invalidation.
    pub fn new(config: ClientConfig) -> TransportResult<Self> {
        Self::builder(config).build()
    }

    /// Start building a client with custom collaborators.
    pub fn builder(config: ClientConfig) -> RealtimeClientBuilder {
        RealtimeClientBuilder {
            config,
            connector: Arc::new(TungsteniteConnector),
            invalidator: Arc::new(NoopInvalidator),
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Open a connection, trying each endpoint in order.
    ///
    /// Resolves immediately when already connected; concurrent callers share
    /// one attempt. When every endpoint fails the error is returned and an
    /// automatic reconnect is scheduled. Calling this after the client gave
    /// up (`Failed`) restarts reconnection with a fresh retry budget.
    pub async fn connect(&self) -> TransportResult<()> {
        self.inner
            .start_attempt(true)
            .await
            .map_err(TransportError::from)
    }

    /// Close the connection and reset the session.
    ///
    /// Buffered batches are flushed first. The pending queue, both id
    /// trackers, the room ids, every event listener and every state observer
    /// are then cleared, and the state becomes `Disconnected` (observers see
    /// that final transition before they are removed).
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.batcher.flush_all();

        let writer = {
            let mut session = inner.session.lock();
            session.epoch = ConnectionEpoch(session.epoch.0.wrapping_add(1));
            session.cancel_timer();
            session.attempt = 0;
            session.queue.clear();
            session.sent.clear();
            session.game_room_id = None;
            session.collaborative_room_id = None;
            session.last_message_id = None;
            session.writer.take()
        };
        if let Some(writer) = writer {
            let _ = writer.send(Outgoing::Close);
        }
        inner.in_flight.lock().take();

        inner.batcher.clear();
        inner.router.clear();
        info!("Disconnected by client");
        inner.state.set_state(ConnectionState::Disconnected, 0);
        inner.state.clear();
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Send `message` with a freshly generated id, returning that id.
    pub fn send(&self, message: OutboundMessage) -> MessageId {
        let id = MessageId::new();
        self.send_with_id(message, id.clone());
        id
    }

    /// Send `message` under a caller-chosen id.
    ///
    /// An id that was already transmitted in this session is skipped. While
    /// no transport is open the message is queued and replayed on
    /// reconnection; otherwise it goes out directly or through the batcher.
    pub fn send_with_id(&self, message: OutboundMessage, id: MessageId) {
        {
            let mut session = self.inner.session.lock();
            if session.sent.contains(&id) {
                debug!(%id, "Skipping already-sent message");
                return;
            }
            session.last_message_id = Some(id.clone());
            if session.writer.is_none() {
                debug!(%id, message_type = %message.message_type(), "Not connected, queueing message");
                // Messages buffered before the transport dropped go first.
                for envelope in self.inner.batcher.drain() {
                    session.queue.enqueue(envelope.message, envelope.id);
                }
                session.queue.enqueue(message, id);
                return;
            }
        }

        let envelope = Envelope::new(id, message);
        if self.inner.config.batch.enabled {
            self.inner.batcher.enqueue(envelope);
        } else {
            self.inner.transmit(vec![envelope]);
        }
    }

    /// Flush every partially filled batch now.
    pub fn flush_all_batches(&self) {
        self.inner.batcher.flush_all();
    }

    /// Drop every queued message.
    pub fn clear_pending_messages(&self) {
        let mut session = self.inner.session.lock();
        let dropped = session.queue.len();
        session.queue.clear();
        debug!(dropped, "Cleared pending messages");
    }

    /// Number of messages waiting for a transport.
    pub fn pending_message_count(&self) -> usize {
        self.inner.session.lock().queue.len()
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Observe connection state changes. `callback` runs once immediately
    /// with the current state and attempt number.
    pub fn on_connection_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectionState, u32) + Send + Sync + 'static,
    {
        self.inner.state.on_state_change(callback)
    }

    /// Remember the game room so the application can rejoin it after a
    /// reconnect. The client never rejoins on its own.
    pub fn set_game_room_id(&self, room_id: Option<RoomId>) {
        self.inner.session.lock().game_room_id = room_id;
    }

    /// Remember the collaboration room, see [`Self::set_game_room_id`].
    pub fn set_collaborative_room_id(&self, room_id: Option<RoomId>) {
        self.inner.session.lock().collaborative_room_id = room_id;
    }

    /// Snapshot of the state preserved across reconnects.
    pub fn reconnection_state(&self) -> ReconnectionSnapshot {
        let (state, attempt) = (self.inner.state.state(), self.inner.state.attempt());
        let session = self.inner.session.lock();
        ReconnectionSnapshot {
            state,
            attempt,
            game_room_id: session.game_room_id.clone(),
            collaborative_room_id: session.collaborative_room_id.clone(),
            pending_messages: session.queue.snapshot(),
            last_message_id: session.last_message_id.clone(),
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Call `listener` for every inbound message of `message_type`.
    pub fn add_event_listener<F>(&self, message_type: MessageType, listener: F) -> Subscription
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.inner.router.add_listener(message_type, listener)
    }

    /// Whether any listener is registered for `message_type`.
    pub fn has_event_listeners(&self, message_type: MessageType) -> bool {
        self.inner.router.has_listeners(message_type)
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("state", &self.connection_state())
            .field("endpoints", &self.inner.config.endpoints)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, Scheme};

    fn client() -> RealtimeClient {
        RealtimeClient::new(ClientConfig::new(Endpoint::new(Scheme::Ws, "127.0.0.1").port(1)))
            .unwrap()
    }

    fn chat(n: usize) -> OutboundMessage {
        OutboundMessage::ChatMessage {
            room_id: RoomId::new("r"),
            content: format!("{n}"),
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = RealtimeClient::new(ClientConfig::default()).unwrap_err();
        assert!(matches!(err, TransportError::Config { .. }));
    }

    #[test]
    fn sends_while_disconnected_are_queued() {
        let client = client();
        for n in 0..150 {
            client.send_with_id(chat(n), MessageId::from(format!("msg-{n}")));
        }

        assert_eq!(client.pending_message_count(), 100);
        let snapshot = client.reconnection_state();
        assert_eq!(snapshot.pending_messages[0].id.as_str(), "msg-50");
        assert_eq!(snapshot.last_message_id, Some(MessageId::from("msg-149")));
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
    }

    #[test]
    fn disconnect_resets_session() {
        let client = client();
        client.set_game_room_id(Some(RoomId::new("g1")));
        client.send(chat(1));
        let _listener = client.add_event_listener(MessageType::Pong, |_| {});
        let observer = client.on_connection_state_change(|_, _| {});

        client.disconnect();

        let snapshot = client.reconnection_state();
        assert!(snapshot.pending_messages.is_empty());
        assert!(snapshot.game_room_id.is_none());
        assert!(snapshot.last_message_id.is_none());
        assert!(!client.has_event_listeners(MessageType::Pong));
        assert_eq!(client.inner.state.callback_count(), 0);
        drop(observer);
    }

    #[test]
    fn room_ids_are_preserved() {
        let client = client();
        client.set_game_room_id(Some(RoomId::new("g1")));
        client.set_collaborative_room_id(Some(RoomId::new("c1")));
        client.set_collaborative_room_id(None);

        let snapshot = client.reconnection_state();
        assert_eq!(snapshot.game_room_id, Some(RoomId::new("g1")));
        assert_eq!(snapshot.collaborative_room_id, None);
    }

    #[test]
    fn clear_pending_messages_empties_queue() {
        let client = client();
        client.send(chat(1));
        client.send(chat(2));
        client.clear_pending_messages();
        assert_eq!(client.pending_message_count(), 0);
    }
}
