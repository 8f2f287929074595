//! Bounded FIFO of outbound messages waiting for a transport.

use std::{collections::VecDeque, sync::OnceLock, time::Instant};

use serde::Serialize;
use tracing::warn;

use crate::{
    message::{Envelope, OutboundMessage, now_millis},
    types::MessageId,
};

/// A message that could not be sent when it was submitted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueuedMessage {
    pub message: OutboundMessage,
    /// Milliseconds since the Unix epoch at enqueue time. Never runs
    /// backwards within a process, even if the wall clock does.
    pub timestamp: i64,
    pub id: MessageId,
}

impl QueuedMessage {
    pub fn into_envelope(self) -> Envelope {
        Envelope::new(self.id, self.message)
    }
}

/// Wall-clock time sampled once, advanced by the monotonic clock.
fn enqueue_millis() -> i64 {
    static ORIGIN: OnceLock<(Instant, i64)> = OnceLock::new();
    let (start, wall) = *ORIGIN.get_or_init(|| (Instant::now(), now_millis()));
    let elapsed = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
    wall.saturating_add(elapsed)
}

/// Pending outbound queue. Inserting past capacity evicts the oldest entry.
#[derive(Debug)]
pub struct PendingQueue {
    entries: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Queue `message` stamped with the current time.
    ///
    /// Returns the entry evicted to make room, if any.
    pub fn enqueue(&mut self, message: OutboundMessage, id: MessageId) -> Option<QueuedMessage> {
        self.push(QueuedMessage {
            message,
            timestamp: enqueue_millis(),
            id,
        })
    }

    pub(crate) fn push(&mut self, entry: QueuedMessage) -> Option<QueuedMessage> {
        self.entries.push_back(entry);
        if self.entries.len() <= self.capacity {
            return None;
        }

        let evicted = self.entries.pop_front();
        if let Some(lost) = &evicted {
            warn!(
                id = %lost.id,
                message_type = %lost.message.message_type(),
                capacity = self.capacity,
                "Pending queue full, dropped oldest message"
            );
        }
        evicted
    }

    /// Take every entry, oldest timestamp first. Entries with equal
    /// timestamps keep their enqueue order.
    pub fn drain_in_order(&mut self) -> Vec<QueuedMessage> {
        let mut drained: Vec<QueuedMessage> = self.entries.drain(..).collect();
        drained.sort_by_key(|entry| entry.timestamp);
        drained
    }

    /// Copy of the queued entries in replay order.
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        let mut entries: Vec<QueuedMessage> = self.entries.iter().cloned().collect();
        entries.sort_by_key(|entry| entry.timestamp);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RoomId;

    fn chat(n: usize) -> OutboundMessage {
        OutboundMessage::ChatMessage {
            room_id: RoomId::new("room"),
            content: format!("message {n}"),
        }
    }

    fn entry(n: usize, timestamp: i64) -> QueuedMessage {
        QueuedMessage {
            message: chat(n),
            timestamp,
            id: MessageId::from(format!("msg-{n}")),
        }
    }

    #[test]
    fn queue_keeps_most_recent_entries() {
        let mut queue = PendingQueue::new(100);
        let mut evicted = 0;
        for n in 0..150 {
            if queue.enqueue(chat(n), MessageId::from(format!("msg-{n}"))).is_some() {
                evicted += 1;
            }
        }

        assert_eq!(evicted, 50);
        assert_eq!(queue.len(), 100);

        let drained = queue.drain_in_order();
        assert_eq!(drained.first().map(|e| e.id.as_str()), Some("msg-50"));
        assert_eq!(drained.last().map(|e| e.id.as_str()), Some("msg-149"));
    }

    #[test]
    fn drain_orders_by_timestamp() {
        let mut queue = PendingQueue::new(10);
        queue.push(entry(3, 300));
        queue.push(entry(1, 100));
        queue.push(entry(2, 200));

        let order: Vec<i64> = queue.drain_in_order().iter().map(|e| e.timestamp).collect();
        assert_eq!(order, vec![100, 200, 300]);
    }

    #[test]
    fn enqueue_timestamps_never_decrease() {
        let mut queue = PendingQueue::new(500);
        for n in 0..500 {
            queue.enqueue(chat(n), MessageId::from(format!("msg-{n}")));
        }

        let stamps: Vec<i64> = queue.entries.iter().map(|e| e.timestamp).collect();
        assert!(stamps.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(stamps[0] > 0);
    }

    #[test]
    fn drain_empties_queue() {
        let mut queue = PendingQueue::new(10);
        queue.push(entry(1, 1));
        queue.push(entry(2, 1));

        let drained = queue.drain_in_order();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id.as_str(), "msg-1");
        assert!(queue.is_empty());
        assert!(queue.drain_in_order().is_empty());
    }
}
