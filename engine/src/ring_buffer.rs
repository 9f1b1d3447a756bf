//! Bounded, lossy FIFO of `Reading`s (spec.md §4.3). One writer (the
//! controller's acquisition thread), many readers (the recorder and any
//! status/tail consumers). On overflow the oldest reading is evicted —
//! acquisition never blocks on a slow or absent consumer.

use crate::reading::Reading;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

pub const DEFAULT_CAPACITY: usize = 10_000;

struct Inner {
    items: VecDeque<Reading>,
    capacity: usize,
    dropped: u64,
    pushed: u64,
}

/// Thread-safe bounded ring buffer. Cloning an `Arc<RingBuffer>` is how
/// producer and consumers share it; the type itself is not `Clone` (there is
/// exactly one buffer per session).
pub struct RingBuffer {
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

/// Point-in-time counters, surfaced by the controller/recorder status verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBufferStats {
    pub len: usize,
    pub capacity: usize,
    pub pushed: u64,
    pub dropped: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be nonzero");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
                dropped: 0,
                pushed: 0,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Appends a reading, evicting the oldest if at capacity. Never blocks.
    pub fn push(&self, reading: Reading) {
        let mut inner = self.inner.lock().unwrap();
        if inner.items.len() == inner.capacity {
            inner.items.pop_front();
            inner.dropped += 1;
        }
        inner.items.push_back(reading);
        inner.pushed += 1;
        self.not_empty.notify_all();
    }

    /// Pops the oldest reading, if any, without blocking.
    pub fn try_pop(&self) -> Option<Reading> {
        self.inner.lock().unwrap().items.pop_front()
    }

    /// Pops the oldest reading, blocking up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: std::time::Duration) -> Option<Reading> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(r) = inner.items.pop_front() {
            return Some(r);
        }
        let (mut guard, result) = self
            .not_empty
            .wait_timeout_while(inner, timeout, |i| i.items.is_empty())
            .unwrap();
        let _ = result;
        guard.items.pop_front()
    }

    /// Drains everything currently buffered, oldest first.
    pub fn drain(&self) -> Vec<Reading> {
        let mut inner = self.inner.lock().unwrap();
        inner.items.drain(..).collect()
    }

    /// A read-only copy of everything currently buffered, oldest first.
    /// Non-destructive: unlike `drain`, repeated calls may overlap. This is
    /// what `snapshot()`-style verbs and the recorder's poll loop use.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.inner.lock().unwrap().items.iter().cloned().collect()
    }

    /// Discards everything currently buffered, without returning it.
    pub fn clear(&self) {
        self.inner.lock().unwrap().items.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RingBufferStats {
        let inner = self.inner.lock().unwrap();
        RingBufferStats {
            len: inner.items.len(),
            capacity: inner.capacity,
            pushed: inner.pushed,
            dropped: inner.dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Mode;
    use chrono::Utc;

    fn reading(v: f64) -> Reading {
        Reading::new(Utc::now(), "Q1", Mode::Freerun, v, None, None)
    }

    #[test]
    fn push_and_pop_preserve_fifo_order() {
        let rb = RingBuffer::new(4);
        rb.push(reading(1.0));
        rb.push(reading(2.0));
        rb.push(reading(3.0));
        assert_eq!(rb.try_pop().unwrap().value, 1.0);
        assert_eq!(rb.try_pop().unwrap().value, 2.0);
        assert_eq!(rb.try_pop().unwrap().value, 3.0);
        assert!(rb.try_pop().is_none());
    }

    #[test]
    fn overflow_evicts_oldest_and_counts_drops() {
        let rb = RingBuffer::new(2);
        rb.push(reading(1.0));
        rb.push(reading(2.0));
        rb.push(reading(3.0));
        let stats = rb.stats();
        assert_eq!(stats.len, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.pushed, 3);
        assert_eq!(rb.try_pop().unwrap().value, 2.0);
        assert_eq!(rb.try_pop().unwrap().value, 3.0);
    }

    #[test]
    fn drain_empties_buffer_in_order() {
        let rb = RingBuffer::new(8);
        for i in 0..5 {
            rb.push(reading(i as f64));
        }
        let drained = rb.drain();
        assert_eq!(drained.len(), 5);
        assert_eq!(drained[0].value, 0.0);
        assert_eq!(drained[4].value, 4.0);
        assert!(rb.is_empty());
    }

    #[test]
    fn pop_timeout_returns_none_when_empty() {
        let rb = RingBuffer::new(4);
        let start = std::time::Instant::now();
        let got = rb.pop_timeout(std::time::Duration::from_millis(30));
        assert!(got.is_none());
        assert!(start.elapsed() >= std::time::Duration::from_millis(25));
    }

    #[test]
    fn pop_timeout_wakes_on_push_from_another_thread() {
        use std::sync::Arc;
        let rb = Arc::new(RingBuffer::new(4));
        let rb2 = rb.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            rb2.push(reading(9.0));
        });
        let got = rb.pop_timeout(std::time::Duration::from_secs(2));
        handle.join().unwrap();
        assert_eq!(got.unwrap().value, 9.0);
    }
}
