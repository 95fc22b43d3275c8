//! Bounded message window.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::collections::vec_deque;

// ============================================================================
// MessageBuffer
// ============================================================================

/// Fixed-capacity FIFO that drops the oldest item when full.
///
/// # Example
///
/// ```
/// use intel_feed::MessageBuffer;
///
/// let mut buffer = MessageBuffer::new(2);
/// buffer.push(1);
/// buffer.push(2);
/// assert_eq!(buffer.push(3), Some(1));
/// assert_eq!(buffer.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct MessageBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> MessageBuffer<T> {
    /// Creates an empty buffer holding at most `capacity` items.
    ///
    /// A capacity of zero keeps nothing.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Appends `item`, returning the evicted oldest item if the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Returns the most recent item.
    #[inline]
    #[must_use]
    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Iterates from oldest to newest.
    #[inline]
    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.items.iter()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Keeps only the items matching `keep`, preserving order.
    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.items.retain(keep);
    }
}

impl<T: Clone> MessageBuffer<T> {
    /// Copies the window out, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_push_under_capacity() {
        let mut buffer = MessageBuffer::new(3);
        assert_eq!(buffer.push("a"), None);
        assert_eq!(buffer.push("b"), None);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.latest(), Some(&"b"));
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut buffer = MessageBuffer::new(0);
        assert_eq!(buffer.push(7), Some(7));
        assert!(buffer.is_empty());
        assert_eq!(buffer.latest(), None);
    }

    #[test]
    fn test_retain_preserves_order() {
        let mut buffer = MessageBuffer::new(5);
        for i in 1..=5 {
            buffer.push(i);
        }
        buffer.retain(|i| i % 2 == 1);
        assert_eq!(buffer.to_vec(), vec![1, 3, 5]);
    }

    proptest! {
        #[test]
        fn prop_keeps_most_recent_in_order(
            capacity in 1usize..64,
            items in proptest::collection::vec(any::<u32>(), 0..256),
        ) {
            let mut buffer = MessageBuffer::new(capacity);
            for item in &items {
                buffer.push(*item);
            }

            let start = items.len().saturating_sub(capacity);
            prop_assert_eq!(buffer.to_vec(), items[start..].to_vec());
            prop_assert!(buffer.len() <= capacity);
        }
    }
}
