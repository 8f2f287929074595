//! Connection state machine and state observers.

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::subscription::Subscription;

/// Connection state machine states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport. Initial state, and the state after any close.
    #[default]
    Disconnected,
    /// Transport open, frames flow directly.
    Connected,
    /// Waiting for (or running) a scheduled reconnection attempt.
    Reconnecting,
    /// Retry budget exhausted. Only a manual `connect()` leaves this state.
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type StateCallback = Arc<dyn Fn(ConnectionState, u32) + Send + Sync>;

#[derive(Default)]
struct StateInner {
    state: ConnectionState,
    attempt: u32,
    next_id: u64,
    callbacks: Vec<(u64, StateCallback)>,
}

/// Current connection state plus the observers interested in it.
///
/// Observers run synchronously on the thread that changes the state, never
/// while the internal lock is held, so they may read the state back.
#[derive(Clone, Default)]
pub struct StateMachine {
    inner: Arc<Mutex<StateInner>>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Reconnect attempt number reported with the last transition.
    pub fn attempt(&self) -> u32 {
        self.inner.lock().attempt
    }

    /// Move to `state`. Observers are notified only when the state actually
    /// changes; the attempt number is recorded either way.
    ///
    /// Returns whether the state changed.
    pub fn set_state(&self, state: ConnectionState, attempt: u32) -> bool {
        let callbacks = {
            let mut inner = self.inner.lock();
            inner.attempt = attempt;
            if inner.state == state {
                return false;
            }
            debug!(from = %inner.state, to = %state, attempt, "Connection state changed");
            inner.state = state;
            inner
                .callbacks
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect::<Vec<_>>()
        };

        for callback in callbacks {
            invoke(&callback, state, attempt);
        }
        true
    }

    /// Register an observer. It is called once right away with the current
    /// state, then on every change until the returned handle unsubscribes.
    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectionState, u32) + Send + Sync + 'static,
    {
        let callback: StateCallback = Arc::new(callback);
        let (id, state, attempt) = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.callbacks.push((id, Arc::clone(&callback)));
            (id, inner.state, inner.attempt)
        };

        invoke(&callback, state, attempt);

        let weak: Weak<Mutex<StateInner>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().callbacks.retain(|(cb_id, _)| *cb_id != id);
            }
        })
    }

    pub fn callback_count(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    /// Drop every registered observer.
    pub fn clear(&self) {
        self.inner.lock().callbacks.clear();
    }
}

fn invoke(callback: &StateCallback, state: ConnectionState, attempt: u32) {
    if catch_unwind(AssertUnwindSafe(|| callback(state, attempt))).is_err() {
        error!(state = %state, "Connection state callback panicked");
    }
}
