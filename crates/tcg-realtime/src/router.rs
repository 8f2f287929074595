//! Inbound dispatch.
//!
//! Decoded frames are deduplicated by id, fed to the cache invalidator for
//! the message types that change server-side state, and then delivered to
//! the listeners registered for their type.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::{
    codec,
    dedup::ProcessedIds,
    message::{InboundFrame, InboundMessage, MessageType},
    subscription::Subscription,
};

/// Marks cached query results stale.
///
/// Keys are hierarchical paths such as `["game-rooms", "<room>", "phase"]`;
/// invalidating a key also covers everything beneath it.
pub trait CacheInvalidator: Send + Sync + 'static {
    fn invalidate(&self, key: &[String]);
}

/// Invalidator that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopInvalidator;

impl CacheInvalidator for NoopInvalidator {
    fn invalidate(&self, _key: &[String]) {}
}

type Listener = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

struct RouterInner {
    listeners: scc::HashMap<MessageType, Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
    received: Mutex<ProcessedIds>,
    invalidator: Arc<dyn CacheInvalidator>,
    max_message_size: usize,
}

/// Routes inbound frames to listeners.
#[derive(Clone)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl EventRouter {
    pub fn new(
        invalidator: Arc<dyn CacheInvalidator>,
        received: ProcessedIds,
        max_message_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                listeners: scc::HashMap::new(),
                next_listener: AtomicU64::new(0),
                received: Mutex::new(received),
                invalidator,
                max_message_size,
            }),
        }
    }

    /// Register `listener` for every inbound message of `message_type`.
    pub fn add_listener<F>(&self, message_type: MessageType, listener: F) -> Subscription
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let listener: Listener = Arc::new(listener);

        let appended = self
            .inner
            .listeners
            .update_sync(&message_type, |_, entries| {
                entries.push((id, Arc::clone(&listener)));
            })
            .is_some();
        if !appended
            && let Err((message_type, entries)) = self
                .inner
                .listeners
                .insert_sync(message_type, vec![(id, Arc::clone(&listener))])
        {
            // Another registration created the entry first.
            self.inner.listeners.update_sync(&message_type, |_, existing| {
                existing.extend(entries);
            });
        }
        trace!(%message_type, listener = id, "Listener registered");

        let weak: Weak<RouterInner> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                EventRouter { inner }.remove_listener(message_type, id);
            }
        })
    }

    fn remove_listener(&self, message_type: MessageType, id: u64) {
        self.inner.listeners.update_sync(&message_type, |_, entries| {
            entries.retain(|(entry_id, _)| *entry_id != id);
        });
        // Drop the type once nothing listens for it.
        self.inner
            .listeners
            .retain_sync(|ty, entries| *ty != message_type || !entries.is_empty());
    }

    /// Number of listeners registered for `message_type`.
    pub fn listener_count(&self, message_type: MessageType) -> usize {
        self.inner
            .listeners
            .update_sync(&message_type, |_, entries| entries.len())
            .unwrap_or(0)
    }

    /// Whether any listener entry exists for `message_type`.
    pub fn has_listeners(&self, message_type: MessageType) -> bool {
        self.listener_count(message_type) > 0
    }

    /// Handle an inbound text frame.
    pub fn dispatch_text(&self, text: &str) {
        if text.len() > self.inner.max_message_size {
            warn!(
                size = text.len(),
                limit = self.inner.max_message_size,
                "Dropping oversized frame"
            );
            return;
        }
        match codec::decode_text(text) {
            Ok(messages) => self.dispatch_values(messages),
            Err(e) => warn!(error = %e, "Dropping malformed frame"),
        }
    }

    /// Handle an inbound binary (compressed batch) frame.
    pub fn dispatch_binary(&self, data: &[u8]) {
        match codec::decode_binary(data, self.inner.max_message_size) {
            Ok(messages) => self.dispatch_values(messages),
            Err(e) => warn!(error = %e, size = data.len(), "Dropping undecodable binary frame"),
        }
    }

    fn dispatch_values(&self, messages: Vec<Value>) {
        for value in messages {
            match serde_json::from_value::<InboundFrame>(value) {
                Ok(frame) => self.dispatch(frame),
                Err(e) => warn!(error = %e, "Dropping unrecognised message"),
            }
        }
    }

    /// Deduplicate, apply cache side effects, and notify listeners.
    pub fn dispatch(&self, frame: InboundFrame) {
        let message_type = frame.message.message_type();
        if let Some(id) = &frame.id
            && !self.inner.received.lock().track(id.clone())
        {
            debug!(%id, %message_type, "Skipping duplicate message");
            return;
        }

        for key in invalidation_keys(&frame.message) {
            trace!(?key, "Invalidating cached data");
            self.inner.invalidator.invalidate(&key);
        }

        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .update_sync(&message_type, |_, entries| {
                entries.iter().map(|(_, l)| Arc::clone(l)).collect()
            })
            .unwrap_or_default();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&frame.message))).is_err() {
                error!(%message_type, "Event listener panicked");
            }
        }
    }

    /// Number of inbound ids remembered for deduplication.
    pub fn received_count(&self) -> usize {
        self.inner.received.lock().len()
    }

    /// Drop every listener and forget every received id.
    pub fn clear(&self) {
        self.inner.listeners.clear_sync();
        self.inner.received.lock().clear();
    }
}

fn key(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| (*p).to_string()).collect()
}

/// Cache keys made stale by `message`.
fn invalidation_keys(message: &InboundMessage) -> Vec<Vec<String>> {
    match message {
        InboundMessage::CollaboratorJoined { room_id, .. }
        | InboundMessage::CollaboratorLeft { room_id, .. } => {
            vec![key(&["collab-rooms", room_id.as_str(), "collaborators"])]
        }
        InboundMessage::PhaseUpdated { room_id, .. } => {
            vec![key(&["game-rooms", room_id.as_str(), "phase"])]
        }
        InboundMessage::RoomState { room_id, .. } | InboundMessage::StateSync { room_id, .. } => {
            vec![key(&["game-rooms", room_id.as_str()])]
        }
        InboundMessage::TournamentUpdated { tournament_id } => {
            vec![key(&["tournaments", tournament_id.as_str()])]
        }
        InboundMessage::ChatMessage { .. }
        | InboundMessage::GameAction { .. }
        | InboundMessage::WebrtcOffer { .. }
        | InboundMessage::WebrtcAnswer { .. }
        | InboundMessage::IceCandidate { .. }
        | InboundMessage::CoordinationEvent { .. }
        | InboundMessage::StatusUpdate { .. }
        | InboundMessage::Typing { .. }
        | InboundMessage::Error { .. }
        | InboundMessage::Pong => Vec::new(),
    }
}
