//! Primitives for the auxiliary host threads (audio mix, present, input).
//!
//! The CPU thread owns all emulation state; aux threads only touch these
//! objects. None of them is ever held across device work, so the CPU thread
//! cannot block on an aux thread.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Manual-reset event: set/reset/wait-with-timeout.
#[derive(Default)]
pub struct Event {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.state.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.state.lock().unwrap() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Waits until set or until `timeout` elapses; returns whether the event
    /// was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.state.lock().unwrap();
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap();
        *guard
    }
}

/// Bounded FIFO between one aux producer and the CPU-thread consumer.
/// On overflow the oldest element is dropped, which is the right behavior for
/// coalescable input events.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, item: T) {
        let mut q = self.inner.lock().unwrap();
        if q.len() == self.capacity {
            q.pop_front();
        }
        q.push_back(item);
    }

    /// Drains everything queued; called by the CPU thread at end-of-frame.
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// One PCM frame stamped with the guest time it was produced at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFrame {
    pub timestamp_ns: u64,
    pub left: i16,
    pub right: i16,
}

/// Single-producer (CPU thread) / single-consumer (audio thread) sample ring.
/// The lock is held only for the queue pointer manipulation; an overrun drops
/// the oldest samples rather than stalling the producer.
pub struct PcmRing {
    inner: Mutex<VecDeque<PcmFrame>>,
    capacity: usize,
    dropped: Mutex<u64>,
}

impl PcmRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: Mutex::new(0),
        }
    }

    pub fn produce(&self, frame: PcmFrame) {
        let mut q = self.inner.lock().unwrap();
        if q.len() == self.capacity {
            q.pop_front();
            *self.dropped.lock().unwrap() += 1;
        }
        q.push_back(frame);
    }

    pub fn consume(&self, dst: &mut Vec<PcmFrame>, max: usize) -> usize {
        let mut q = self.inner.lock().unwrap();
        let n = max.min(q.len());
        dst.extend(q.drain(..n));
        n
    }

    pub fn dropped_frames(&self) -> u64 {
        *self.dropped.lock().unwrap()
    }
}
