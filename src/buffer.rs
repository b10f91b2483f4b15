//! Bounded history of raw readings for the real-time path.
//!
//! A fixed-capacity FIFO: appending to a full buffer evicts the oldest
//! reading first. The simulation driver is the only writer and the only
//! reader, so there is no locking; concurrent simulations each own their
//! own buffer.

use std::collections::VecDeque;

use crate::model::{RawReading, RawTable};

#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    capacity: usize,
    readings: VecDeque<RawReading>,
}

impl HistoryBuffer {
    /// Creates an empty buffer. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            readings: VecDeque::with_capacity(capacity),
        }
    }

    /// Creates a buffer pre-filled with `history`, keeping only the newest
    /// `capacity` readings.
    pub fn seeded(capacity: usize, history: &[RawReading]) -> Self {
        let mut buffer = Self::new(capacity);
        for reading in history {
            buffer.append(*reading);
        }
        buffer
    }

    /// Appends a reading, returning the evicted oldest reading if the buffer
    /// was full.
    pub fn append(&mut self, reading: RawReading) -> Option<RawReading> {
        let evicted = if self.readings.len() == self.capacity {
            self.readings.pop_front()
        } else {
            None
        };
        self.readings.push_back(reading);
        evicted
    }

    /// Current contents, oldest first. Does not mutate the buffer.
    pub fn snapshot(&self) -> RawTable {
        self.readings.iter().copied().collect()
    }

    pub fn latest(&self) -> Option<&RawReading> {
        self.readings.back()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.readings.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(i: usize) -> RawReading {
        RawReading::new(i as f64, 0.0, 0.0)
    }

    #[test]
    fn test_append_beyond_capacity_keeps_most_recent_in_order() {
        let capacity = 100;
        let k = 17;
        let mut buffer = HistoryBuffer::new(capacity);
        for i in 0..capacity + k {
            buffer.append(reading(i));
        }

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), capacity);
        let order: Vec<usize> = snapshot.iter().map(|r| r.rainfall as usize).collect();
        let expected: Vec<usize> = (k..capacity + k).collect();
        assert_eq!(order, expected, "first {} readings must be evicted, rest oldest-first", k);
    }

    #[test]
    fn test_append_reports_evicted_reading() {
        let mut buffer = HistoryBuffer::new(2);
        assert_eq!(buffer.append(reading(0)), None);
        assert_eq!(buffer.append(reading(1)), None);
        assert!(buffer.is_full());
        assert_eq!(buffer.append(reading(2)), Some(reading(0)));
        assert_eq!(buffer.latest(), Some(&reading(2)));
    }

    #[test]
    fn test_snapshot_does_not_mutate() {
        let buffer = HistoryBuffer::seeded(5, &[reading(1), reading(2)]);
        let first = buffer.snapshot();
        let second = buffer.snapshot();
        assert_eq!(first, second);
        assert_eq!(buffer.len(), 2);
        assert!(!buffer.is_full());
    }

    #[test]
    fn test_seeded_with_long_history_keeps_tail() {
        let history: Vec<RawReading> = (0..250).map(reading).collect();
        let buffer = HistoryBuffer::seeded(100, &history);
        assert_eq!(buffer.snapshot(), history[150..].to_vec());
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let mut buffer = HistoryBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        buffer.append(reading(3));
        buffer.append(reading(4));
        assert_eq!(buffer.snapshot(), vec![reading(4)]);
        assert!(!buffer.is_empty());
    }
}
