use std::collections::VecDeque;

use crate::record::RecordId;

/// FIFO of records waiting for a transfer slot. An id is held at most once.
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    items: VecDeque<RecordId>,
}

impl AdmissionQueue {
    /// Appends `id` unless it is already waiting. Returns whether it was added.
    pub fn push(&mut self, id: RecordId) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.items.push_back(id);
        true
    }

    pub fn pop(&mut self) -> Option<RecordId> {
        self.items.pop_front()
    }

    pub fn remove(&mut self, id: &RecordId) -> bool {
        let before = self.items.len();
        self.items.retain(|queued| queued != id);
        before != self.items.len()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.items.contains(id)
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.items.iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
