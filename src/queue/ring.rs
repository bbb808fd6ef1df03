//! Lock-free bounded rings.
//!
//! Both variants wrap a `crossbeam` `ArrayQueue`: a wait-free enqueue/dequeue
//! plus a spin-wait with a CPU pause hint for whatever slack remains of the
//! caller's deadline. The SPSC and MPMC types are distinct so the catalog can
//! keep the cardinality contract explicit; the single-producer variant is
//! simply the same ring with a narrower usage contract.

use super::{Queue, QueueBase, QueueCounters, QueueStats, QueueTimeout};
use crossbeam::queue::ArrayQueue;
use std::time::{Duration, Instant};

struct Ring<T> {
    name: String,
    queue: ArrayQueue<T>,
    counters: QueueCounters,
}

impl<T> Ring<T> {
    fn new(name: String, capacity: usize) -> Self {
        Ring {
            name,
            queue: ArrayQueue::new(capacity.max(1)),
            counters: QueueCounters::default(),
        }
    }

    fn timeout(&self, operation: &'static str, timeout: Duration) -> QueueTimeout {
        QueueTimeout {
            queue: self.name.clone(),
            operation,
            timeout_ms: timeout.as_millis(),
        }
    }

    fn push(&self, value: T, timeout: Duration) -> Result<(), QueueTimeout> {
        let deadline = Instant::now() + timeout;
        let mut value = value;
        loop {
            match self.queue.push(value) {
                Ok(()) => {
                    self.counters.record_push();
                    return Ok(());
                }
                Err(rejected) => {
                    if Instant::now() >= deadline {
                        self.counters.record_push_timeout();
                        return Err(self.timeout("push", timeout));
                    }
                    value = rejected;
                    std::hint::spin_loop();
                }
            }
        }
    }

    fn pop(&self, deadline: Instant) -> Option<T> {
        loop {
            if let Some(value) = self.queue.pop() {
                self.counters.record_pop();
                return Some(value);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::hint::spin_loop();
        }
    }

    fn stats(&self) -> QueueStats {
        self.counters
            .snapshot(self.queue.len(), self.queue.capacity())
    }
}

macro_rules! ring_queue {
    ($(#[$doc:meta])* $type:ident) => {
        $(#[$doc])*
        pub struct $type<T> {
            ring: Ring<T>,
        }

        impl<T> $type<T> {
            pub fn new(name: impl Into<String>, capacity: usize) -> Self {
                $type {
                    ring: Ring::new(name.into(), capacity),
                }
            }
        }

        impl<T: Send> QueueBase for $type<T> {
            fn name(&self) -> &str {
                &self.ring.name
            }

            fn capacity(&self) -> usize {
                self.ring.queue.capacity()
            }

            fn len(&self) -> usize {
                self.ring.queue.len()
            }

            fn can_push(&self) -> bool {
                !self.ring.queue.is_full()
            }

            fn can_pop(&self) -> bool {
                !self.ring.queue.is_empty()
            }

            fn stats(&self) -> QueueStats {
                self.ring.stats()
            }
        }

        impl<T: Send> Queue<T> for $type<T> {
            fn push(&self, value: T, timeout: Duration) -> Result<(), QueueTimeout> {
                self.ring.push(value, timeout)
            }

            fn pop(&self, timeout: Duration) -> Result<T, QueueTimeout> {
                let deadline = Instant::now() + timeout;
                self.ring
                    .pop(deadline)
                    .ok_or_else(|| {
                        self.ring.counters.record_pop_timeout();
                        self.ring.timeout("pop", timeout)
                    })
            }

            fn poll(&self, timeout: Duration) -> Option<T> {
                self.ring.pop(Instant::now() + timeout)
            }
        }
    };
}

ring_queue! {
    /// Single-producer / single-consumer bounded ring.
    ///
    /// Correct only for one producer thread and one consumer thread; the
    /// fabric does not police this.
    SpscQueue
}

ring_queue! {
    /// Multi-producer / multi-consumer bounded ring. Cross-producer ordering
    /// is best-effort.
    MpmcQueue
}
