//! Bounded set of already-processed message ids.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use crate::types::MessageId;

/// Insertion-ordered id set with a hard capacity.
///
/// On overflow the oldest `ceil(capacity * eviction_ratio)` ids are evicted in
/// one pass, so cleanup cost is paid once per batch of inserts rather than on
/// every insert.
#[derive(Debug)]
pub struct ProcessedIds {
    order: VecDeque<MessageId>,
    members: HashSet<MessageId>,
    capacity: usize,
    evict_count: usize,
}

impl ProcessedIds {
    pub fn new(capacity: usize, eviction_ratio: f64) -> Self {
        let evict_count = ((capacity as f64) * eviction_ratio).ceil() as usize;
        Self {
            order: VecDeque::with_capacity(capacity + 1),
            members: HashSet::with_capacity(capacity + 1),
            capacity,
            evict_count: evict_count.clamp(1, capacity.max(1)),
        }
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn track(&mut self, id: MessageId) -> bool {
        if !self.members.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);

        if self.order.len() > self.capacity {
            let evict = self.evict_count.min(self.order.len());
            for old in self.order.drain(..evict) {
                self.members.remove(&old);
            }
            debug!(evicted = evict, remaining = self.order.len(), "Evicted processed ids");
        }
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.members.contains(id)
    }

    /// Remove `id` so it may be processed again.
    pub fn forget(&mut self, id: &MessageId) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        if let Some(pos) = self.order.iter().position(|existing| existing == id) {
            self.order.remove(pos);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> MessageId {
        MessageId::from(format!("msg-{n}"))
    }

    #[test]
    fn track_reports_duplicates() {
        let mut ids = ProcessedIds::new(10, 0.2);
        assert!(ids.track(id(1)));
        assert!(!ids.track(id(1)));
        assert!(ids.contains(&id(1)));
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn overflow_evicts_oldest_fifth_in_one_pass() {
        let mut ids = ProcessedIds::new(1000, 0.2);
        for n in 0..1200 {
            ids.track(id(n));
        }

        assert!(ids.len() <= 1000);
        assert!(!ids.contains(&id(0)));
        assert!(!ids.contains(&id(100)));
        assert!(ids.contains(&id(1100)));
        assert!(ids.contains(&id(1199)));
    }

    #[test]
    fn eviction_happens_only_past_capacity() {
        let mut ids = ProcessedIds::new(1000, 0.2);
        for n in 0..1000 {
            ids.track(id(n));
        }
        assert_eq!(ids.len(), 1000);

        ids.track(id(1000));
        assert_eq!(ids.len(), 801);
        assert!(!ids.contains(&id(199)));
        assert!(ids.contains(&id(200)));
    }

    #[test]
    fn forget_allows_retracking() {
        let mut ids = ProcessedIds::new(10, 0.2);
        ids.track(id(1));
        assert!(ids.forget(&id(1)));
        assert!(!ids.forget(&id(1)));
        assert!(ids.track(id(1)));
        assert_eq!(ids.len(), 1);
    }
}
