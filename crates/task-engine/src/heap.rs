use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A value waiting for its due time
#[derive(Debug, Clone)]
pub struct Item<T> {
    pub due_at: DateTime<Utc>,
    pub value: T,
}

/// Heap entry ordered so that the earliest due time sits on top
struct Entry<T> {
    item: Item<T>,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.item.due_at == other.item.due_at
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap
        other.item.due_at.cmp(&self.item.due_at)
    }
}

/// Min-heap of items keyed by due time. Ties come out in no particular order.
pub struct MinHeap<T> {
    heap: BinaryHeap<Entry<T>>,
}

impl<T> MinHeap<T> {
    pub fn new() -> Self {
        MinHeap {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, item: Item<T>) {
        self.heap.push(Entry { item });
    }

    pub fn pop(&mut self) -> Option<Item<T>> {
        self.heap.pop().map(|entry| entry.item)
    }

    pub fn peek(&self) -> Option<&Item<T>> {
        self.heap.peek().map(|entry| &entry.item)
    }

    /// Due time of the earliest item
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.peek().map(|item| item.due_at)
    }

    /// Pop the earliest item if it is due at `now`
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<Item<T>> {
        match self.next_due() {
            Some(due_at) if due_at <= now => self.pop(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<T> Default for MinHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn item(due_at: DateTime<Utc>, value: u32) -> Item<u32> {
        Item { due_at, value }
    }

    #[test]
    fn test_earliest_first() {
        let now = Utc::now();
        let mut heap = MinHeap::new();

        heap.push(item(now + Duration::seconds(3), 3));
        heap.push(item(now + Duration::seconds(1), 1));
        heap.push(item(now + Duration::seconds(2), 2));

        assert_eq!(heap.len(), 3);
        assert_eq!(heap.peek().unwrap().value, 1);
        assert_eq!(heap.pop().unwrap().value, 1);
        assert_eq!(heap.pop().unwrap().value, 2);
        assert_eq!(heap.pop().unwrap().value, 3);
        assert!(heap.pop().is_none());
        assert!(heap.is_empty());
    }

    #[test]
    fn test_pop_due() {
        let now = Utc::now();
        let mut heap = MinHeap::new();

        heap.push(item(now + Duration::seconds(10), 10));
        heap.push(item(now - Duration::seconds(1), 0));

        assert_eq!(heap.pop_due(now).unwrap().value, 0);
        assert!(heap.pop_due(now).is_none());
        assert_eq!(heap.next_due(), Some(now + Duration::seconds(10)));
    }

    proptest! {
        #[test]
        fn prop_pops_in_due_order(offsets in proptest::collection::vec(-10_000i64..10_000, 0..200)) {
            let base = Utc::now();
            let mut heap = MinHeap::new();
            for (i, offset) in offsets.iter().enumerate() {
                heap.push(item(base + Duration::milliseconds(*offset), i as u32));
            }

            let mut last = None;
            let mut popped = 0;
            while let Some(item) = heap.pop() {
                if let Some(prev) = last {
                    prop_assert!(prev <= item.due_at);
                }
                last = Some(item.due_at);
                popped += 1;
            }
            prop_assert_eq!(popped, offsets.len());
        }
    }
}
