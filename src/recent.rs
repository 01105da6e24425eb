use std::collections::{HashMap, VecDeque};

use crate::message::MessageId;

/// Bounded memory of recently seen message ids. The oldest id is forgotten
/// once `capacity` is reached.
pub(crate) struct RecentIds<V> {
    capacity: usize,
    order: VecDeque<MessageId>,
    entries: HashMap<MessageId, V>,
}

impl<V> RecentIds<V> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub(crate) fn insert(&mut self, id: MessageId, value: V) {
        if self.entries.insert(id, value).is_some() {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub(crate) fn get(&self, id: &MessageId) -> Option<&V> {
        self.entries.get(id)
    }

    pub(crate) fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }
}
