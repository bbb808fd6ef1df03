//! # Bounded Queue Primitives
//!
//! Three bounded FIFO variants with an identical typed interface back every
//! intra-process connection:
//!
//! - [`DequeQueue`]: mutex + condvar deque, safe for any producer/consumer
//!   cardinality ([`deque`]).
//! - [`SpscQueue`] / [`MpmcQueue`]: lock-free rings with a spin-wait for the
//!   remaining slack of the deadline ([`ring`]).
//!
//! All variants are bounded at construction, move elements on the hot path,
//! and offer timed blocking (`push`/`pop`) plus non-throwing (`try_push`/
//! `try_pop`) forms. A zero timeout makes every operation non-blocking.
//!
//! `len`, `can_push` and `can_pop` are **hints**: the lock-free variants
//! report a size guess and any emptiness/fullness check is racy by nature.
//! Correctness is only guaranteed for the cardinality implied by the variant
//! name; violating it is caller error.
//!
//! [`DequeQueue`]: deque::DequeQueue
//! [`SpscQueue`]: ring::SpscQueue
//! [`MpmcQueue`]: ring::MpmcQueue

use crate::error::FabricError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::error;

pub mod deque;
pub mod registry;
pub mod ring;

pub use deque::DequeQueue;
pub use registry::QueueRegistry;
pub use ring::{MpmcQueue, SpscQueue};

/// Deadline expiry on a queue operation.
#[derive(Debug, Error)]
#[error("{queue}: unable to {operation} within timeout period ({timeout_ms} ms)")]
pub struct QueueTimeout {
    pub queue: String,
    pub operation: &'static str,
    pub timeout_ms: u128,
}

impl From<QueueTimeout> for FabricError {
    fn from(t: QueueTimeout) -> Self {
        FabricError::TimeoutExpired {
            name: t.queue,
            operation: t.operation,
            timeout_ms: t.timeout_ms,
        }
    }
}

/// Counter snapshot for one queue instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub push_timeouts: u64,
    pub pop_timeouts: u64,
    /// Size guess at snapshot time.
    pub len: usize,
    pub capacity: usize,
}

/// Shared per-queue counters, updated on the hot path with relaxed atomics.
#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    pushed: AtomicU64,
    popped: AtomicU64,
    push_timeouts: AtomicU64,
    pop_timeouts: AtomicU64,
}

impl QueueCounters {
    pub(crate) fn record_push(&self) {
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pop(&self) {
        self.popped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_push_timeout(&self) {
        self.push_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pop_timeout(&self) {
        self.pop_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, len: usize, capacity: usize) -> QueueStats {
        QueueStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            push_timeouts: self.push_timeouts.load(Ordering::Relaxed),
            pop_timeouts: self.pop_timeouts.load(Ordering::Relaxed),
            len,
            capacity,
        }
    }
}

/// Type-independent view of a queue, used by the registry for telemetry.
pub trait QueueBase: Send + Sync {
    fn name(&self) -> &str;

    fn capacity(&self) -> usize;

    /// Current number of elements. A hint for the lock-free variants.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advisory: whether a push would currently succeed.
    fn can_push(&self) -> bool;

    /// Advisory: whether a pop would currently succeed.
    fn can_pop(&self) -> bool;

    fn stats(&self) -> QueueStats;
}

/// The typed bounded-FIFO contract shared by all variants.
pub trait Queue<T: Send>: QueueBase {
    /// Move `value` into the queue, waiting up to `timeout` for space.
    fn push(&self, value: T, timeout: Duration) -> Result<(), QueueTimeout>;

    /// Move the front element out, waiting up to `timeout` for data.
    fn pop(&self, timeout: Duration) -> Result<T, QueueTimeout>;

    /// Non-throwing push: reports the timeout as a logged error and returns
    /// `false` instead of raising.
    fn try_push(&self, value: T, timeout: Duration) -> bool {
        match self.push(value, timeout) {
            Ok(()) => true,
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }

    /// Non-throwing pop: reports the timeout as a logged error and returns
    /// `None` instead of raising.
    fn try_pop(&self, timeout: Duration) -> Option<T> {
        match self.pop(timeout) {
            Ok(v) => Some(v),
            Err(e) => {
                error!("{}", e);
                None
            }
        }
    }

    /// Like [`Queue::try_pop`] but silent on expiry; used by callback
    /// workers that poll in small quanta.
    fn poll(&self, timeout: Duration) -> Option<T>;
}

impl<T: Send> std::fmt::Debug for dyn Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name())
            .field("capacity", &self.capacity())
            .finish()
    }
}
