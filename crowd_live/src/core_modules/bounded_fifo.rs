// THEORY:
// Every rolling buffer the dashboard keeps (count history, alert logs, per-cell
// history) follows the same rule: append at the back, and once the buffer is
// over its capacity drop from the front until it fits again. Survivors keep
// their relative order. `BoundedFifo` makes that rule a property of the type
// instead of something each caller re-implements with a slice, so no buffer can
// ever be observed above its cap.

use serde::{Serialize, Serializer};
use std::collections::VecDeque;

/// An append-only sequence that evicts its oldest entries past `capacity`.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedFifo<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedFifo<T> {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `item`, returning the entry evicted to make room, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        self.items.push_back(item);
        if self.items.len() > self.capacity {
            self.items.pop_front()
        } else {
            None
        }
    }

    /// Appends every item in order, then trims. Returns how many were evicted.
    pub fn extend<I: IntoIterator<Item = T>>(&mut self, items: I) -> usize {
        self.items.extend(items);
        let overflow = self.items.len().saturating_sub(self.capacity);
        self.items.drain(..overflow).for_each(drop);
        overflow
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> BoundedFifo<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

impl<'a, T> IntoIterator for &'a BoundedFifo<T> {
    type Item = &'a T;
    type IntoIter = std::collections::vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T: Serialize> Serialize for BoundedFifo<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.items.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_evicts_oldest_first() {
        let mut fifo = BoundedFifo::new(3);
        assert_eq!(fifo.push(1), None);
        assert_eq!(fifo.push(2), None);
        assert_eq!(fifo.push(3), None);
        assert_eq!(fifo.push(4), Some(1));
        assert_eq!(fifo.to_vec(), vec![2, 3, 4]);
        assert_eq!(fifo.latest(), Some(&4));
    }

    #[test]
    fn extend_trims_after_appending_the_whole_batch() {
        let mut fifo = BoundedFifo::new(6);
        fifo.extend(0..4);
        let evicted = fifo.extend(10..15);
        assert_eq!(evicted, 3);
        assert_eq!(fifo.to_vec(), vec![3, 10, 11, 12, 13, 14]);
    }

    #[test]
    fn a_batch_larger_than_capacity_keeps_its_tail() {
        let mut fifo = BoundedFifo::new(2);
        fifo.extend(["a", "b", "c", "d"]);
        assert_eq!(fifo.to_vec(), vec!["c", "d"]);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let mut fifo = BoundedFifo::new(0);
        fifo.push('x');
        fifo.push('y');
        assert_eq!(fifo.capacity(), 1);
        assert_eq!(fifo.to_vec(), vec!['y']);
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut fifo = BoundedFifo::new(10);
        for i in 0..1000 {
            fifo.push(i);
            assert!(fifo.len() <= 10);
        }
        assert_eq!(fifo.to_vec(), (990..1000).collect::<Vec<_>>());
    }

    #[test]
    fn serializes_as_a_plain_sequence() {
        let mut fifo = BoundedFifo::new(2);
        fifo.extend([1, 2, 3]);
        assert_eq!(serde_json::to_string(&fifo).unwrap(), "[2,3]");
    }
}
