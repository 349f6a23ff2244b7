//! # Bounded Ring Buffer
//!
//! A disposable multi-producer/multi-consumer queue that never blocks.
//! Producers see a full ring as `offer == false` and translate that into a
//! logged drop or a backpressure error; consumers pace an empty ring with
//! an idle sleep. `dispose` tears the ring down exactly once and turns
//! every later operation into [`RingDisposed`].

use std::collections::VecDeque;
use std::sync::Mutex;

/// Error returned by ring operations after `dispose`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingDisposed;

impl std::fmt::Display for RingDisposed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ring buffer disposed")
    }
}

impl std::error::Error for RingDisposed {}

struct Inner<T> {
    queue: VecDeque<T>,
    disposed: bool,
}

/// Bounded, disposable, non-blocking MPMC queue.
pub struct RingBuffer<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                disposed: false,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue without blocking. `Ok(false)` when the ring is full.
    pub fn offer(&self, item: T) -> Result<bool, RingDisposed> {
        let mut inner = self.inner.lock().expect("ring lock poisoned");
        if inner.disposed {
            return Err(RingDisposed);
        }
        if inner.queue.len() >= self.capacity {
            return Ok(false);
        }
        inner.queue.push_back(item);
        Ok(true)
    }

    /// Dequeue without blocking. `Ok(None)` when the ring is empty.
    pub fn poll(&self) -> Result<Option<T>, RingDisposed> {
        let mut inner = self.inner.lock().expect("ring lock poisoned");
        if inner.disposed {
            return Err(RingDisposed);
        }
        Ok(inner.queue.pop_front())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ring lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Idempotent. Drops queued items; later `offer`/`poll` fail.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock().expect("ring lock poisoned");
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        inner.queue.clear();
    }
}
