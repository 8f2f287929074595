//! Priority-aware outbound batching.
//!
//! Critical messages bypass the batcher entirely. Every other priority class
//! has its own buffer and its own delay; a buffer flushes when it reaches
//! `max_batch_size` or when its delay elapses, whichever comes first.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{runtime::Handle, task::AbortHandle};
use tracing::{debug, trace};

use crate::{
    config::BatchConfig,
    message::{Envelope, Priority},
};

/// Receives batches as they are flushed.
pub trait BatchSink: Send + Sync + 'static {
    /// Hand a flushed batch (or a single bypassing message) to the transport.
    fn flush(&self, priority: Priority, envelopes: Vec<Envelope>);
}

#[derive(Default)]
struct Lane {
    buffer: Vec<Envelope>,
    timer: Option<AbortHandle>,
    /// Bumped on every flush so a timer that lost the race does nothing.
    round: u64,
}

impl Lane {
    fn take(&mut self) -> Vec<Envelope> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.round = self.round.wrapping_add(1);
        std::mem::take(&mut self.buffer)
    }
}

struct BatcherInner {
    config: BatchConfig,
    sink: Arc<dyn BatchSink>,
    lanes: Mutex<[Lane; 3]>,
}

/// Per-priority message batcher.
#[derive(Clone)]
pub struct MessageBatcher {
    inner: Arc<BatcherInner>,
}

fn lane_index(priority: Priority) -> Option<usize> {
    match priority {
        Priority::Critical => None,
        Priority::High => Some(0),
        Priority::Normal => Some(1),
        Priority::Low => Some(2),
    }
}

impl MessageBatcher {
    pub fn new(config: BatchConfig, sink: Arc<dyn BatchSink>) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                config,
                sink,
                lanes: Mutex::new(Default::default()),
            }),
        }
    }

    /// Buffer `envelope` according to its priority.
    pub fn enqueue(&self, envelope: Envelope) {
        let priority = envelope.message.priority();
        let (Some(index), Some(delay)) = (
            lane_index(priority),
            priority.batch_delay(self.inner.config.base_delay),
        ) else {
            trace!(id = %envelope.id, "Critical message bypasses batching");
            self.inner.sink.flush(priority, vec![envelope]);
            return;
        };

        let ready = {
            let mut lanes = self.inner.lanes.lock();
            let lane = &mut lanes[index];
            lane.buffer.push(envelope);

            if lane.buffer.len() >= self.inner.config.max_batch_size {
                Some(lane.take())
            } else if lane.timer.is_none() {
                match self.schedule(priority, lane.round, delay) {
                    Some(timer) => {
                        lane.timer = Some(timer);
                        None
                    }
                    // No runtime to drive the timer.
                    None => Some(lane.take()),
                }
            } else {
                None
            }
        };

        if let Some(batch) = ready {
            debug!(?priority, size = batch.len(), "Flushing batch");
            self.inner.sink.flush(priority, batch);
        }
    }

    fn schedule(&self, priority: Priority, round: u64, delay: Duration) -> Option<AbortHandle> {
        let handle = Handle::try_current().ok()?;
        let weak: Weak<BatcherInner> = Arc::downgrade(&self.inner);
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                MessageBatcher { inner }.flush_round(priority, round);
            }
        });
        Some(task.abort_handle())
    }

    fn flush_round(&self, priority: Priority, round: u64) {
        let Some(index) = lane_index(priority) else {
            return;
        };
        let batch = {
            let mut lanes = self.inner.lanes.lock();
            let lane = &mut lanes[index];
            if lane.round != round {
                return;
            }
            lane.timer = None;
            lane.take()
        };
        if !batch.is_empty() {
            debug!(?priority, size = batch.len(), "Batch delay elapsed");
            self.inner.sink.flush(priority, batch);
        }
    }

    /// Flush every non-empty buffer, highest priority first.
    pub fn flush_all(&self) {
        let batches: Vec<(Priority, Vec<Envelope>)> = {
            let mut lanes = self.inner.lanes.lock();
            Priority::BATCHED
                .iter()
                .zip(lanes.iter_mut())
                .filter(|(_, lane)| !lane.buffer.is_empty())
                .map(|(priority, lane)| (*priority, lane.take()))
                .collect()
        };
        for (priority, batch) in batches {
            self.inner.sink.flush(priority, batch);
        }
    }

    /// Take every buffered message without flushing it, highest priority
    /// first, and cancel the pending timers.
    pub fn drain(&self) -> Vec<Envelope> {
        let mut lanes = self.inner.lanes.lock();
        lanes.iter_mut().flat_map(Lane::take).collect()
    }

    /// Discard buffered messages and cancel pending timers.
    pub fn clear(&self) {
        let mut lanes = self.inner.lanes.lock();
        for lane in lanes.iter_mut() {
            lane.take();
        }
    }

    /// Number of messages currently buffered across all priorities.
    pub fn buffered(&self) -> usize {
        self.inner.lanes.lock().iter().map(|lane| lane.buffer.len()).sum()
    }
}
