use std::collections::VecDeque;

/// Number of entries retained when no explicit capacity is configured.
pub const DEFAULT_FEED_CAPACITY: usize = 50;

/// Bounded, newest-first collection of delivered items.
///
/// Pushing beyond capacity evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct EventFeed<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> EventFeed<T> {
    /// Creates an empty feed. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Inserts `item` as the newest entry and returns the evicted entry, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        self.items.push_front(item);
        if self.items.len() > self.capacity {
            self.items.pop_back()
        } else {
            None
        }
    }

    /// Iterates from newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Removes every entry, returning them oldest first.
    pub fn drain_oldest_first(&mut self) -> Vec<T> {
        self.items.drain(..).rev().collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T> Default for EventFeed<T> {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}
