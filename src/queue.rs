//! Bounded hand-off queue between the detection thread and the persistence thread.
//!
//! `push` never blocks: when the queue is full the oldest unpersisted event is
//! dropped and counted. `pop_timeout` blocks the consumer with a timeout so it can
//! observe shutdown. After `close`, pushes are rejected and the consumer drains
//! whatever is left.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::event::SealedEvent;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub rejected_after_close: u64,
    pub depth: usize,
}

struct Inner {
    items: VecDeque<SealedEvent>,
    closed: bool,
    stats: QueueStats,
}

pub struct EventQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    ready: Condvar,
}

/// Outcome of a non-blocking push.
#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// Queued, and this older event was evicted to make room.
    QueuedDroppedOldest(Box<SealedEvent>),
    /// Queue closed; the event is handed back.
    Closed(Box<SealedEvent>),
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                stats: QueueStats::default(),
            }),
            ready: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, event: SealedEvent) -> PushOutcome {
        let mut inner = self.lock();
        if inner.closed {
            inner.stats.rejected_after_close += 1;
            return PushOutcome::Closed(Box::new(event));
        }
        let mut dropped = None;
        if inner.items.len() >= self.capacity {
            if let Some(oldest) = inner.items.pop_front() {
                inner.stats.dropped += 1;
                log::warn!(
                    "event queue full (capacity {}): dropped oldest event {} (dropped total {})",
                    self.capacity,
                    oldest.id(),
                    inner.stats.dropped
                );
                dropped = Some(Box::new(oldest));
            }
        }
        inner.items.push_back(event);
        inner.stats.enqueued += 1;
        inner.stats.depth = inner.items.len();
        drop(inner);
        self.ready.notify_one();
        match dropped {
            Some(old) => PushOutcome::QueuedDroppedOldest(old),
            None => PushOutcome::Queued,
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<SealedEvent> {
        let mut inner = self.lock();
        let item = inner.items.pop_front();
        inner.stats.depth = inner.items.len();
        item
    }

    /// Wait up to `timeout` for an event. Returns `None` on timeout, or when the
    /// queue is closed and empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<SealedEvent> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                inner.stats.depth = inner.items.len();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            inner = match self.ready.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Stop accepting events and wake the consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Remove everything still queued (used when the shutdown grace period runs out).
    pub fn drain_remaining(&self) -> Vec<SealedEvent> {
        let mut inner = self.lock();
        let items: Vec<SealedEvent> = inner.items.drain(..).collect();
        inner.stats.depth = 0;
        items
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
