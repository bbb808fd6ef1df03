//! Mutex + condvar bounded deque.
//!
//! The safe-for-anything variant: a `parking_lot` mutex guards a `VecDeque`,
//! with two condition predicates (*not-full*, *not-empty*) and a timed mutex
//! acquisition so a contended lock cannot eat more than the caller's
//! deadline.

use super::{Queue, QueueBase, QueueCounters, QueueStats, QueueTimeout};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub struct DequeQueue<T> {
    name: String,
    capacity: usize,
    inner: Mutex<VecDeque<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    // Size mirror so can_push/can_pop stay lock-free hints.
    size: AtomicUsize,
    counters: QueueCounters,
}

impl<T> DequeQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        DequeQueue {
            name: name.into(),
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            size: AtomicUsize::new(0),
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
}

impl<T: Send> QueueBase for DequeQueue<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    fn can_push(&self) -> bool {
        self.len() < self.capacity
    }

    fn can_pop(&self) -> bool {
        self.len() > 0
    }

    fn stats(&self) -> QueueStats {
        self.counters.snapshot(self.len(), self.capacity)
    }
}

impl<T: Send> Queue<T> for DequeQueue<T> {
    fn push(&self, value: T, timeout: Duration) -> Result<(), QueueTimeout> {
        let deadline = Instant::now() + timeout;

        let mut deque = match self.inner.try_lock_until(deadline) {
            Some(guard) => guard,
            None => {
                self.counters.record_push_timeout();
                return Err(self.timeout("push", timeout));
            }
        };

        while deque.len() >= self.capacity {
            let now = Instant::now();
            if now >= deadline {
                self.counters.record_push_timeout();
                return Err(self.timeout("push", timeout));
            }
            self.not_full.wait_for(&mut deque, deadline - now);
        }

        deque.push_back(value);
        self.size.store(deque.len(), Ordering::Relaxed);
        self.counters.record_push();
        self.not_empty.notify_one();
        Ok(())
    }

    fn pop(&self, timeout: Duration) -> Result<T, QueueTimeout> {
        let deadline = Instant::now() + timeout;

        let mut deque = match self.inner.try_lock_until(deadline) {
            Some(guard) => guard,
            None => {
                self.counters.record_pop_timeout();
                return Err(self.timeout("pop", timeout));
            }
        };

        while deque.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                self.counters.record_pop_timeout();
                return Err(self.timeout("pop", timeout));
            }
            self.not_empty.wait_for(&mut deque, deadline - now);
        }

        // Loop exit guarantees an element.
        let value = deque.pop_front().expect("deque is non-empty");
        self.size.store(deque.len(), Ordering::Relaxed);
        self.counters.record_pop();
        self.not_full.notify_one();
        Ok(value)
    }

    fn poll(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;

        let mut deque = self.inner.try_lock_until(deadline)?;
        while deque.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.not_empty.wait_for(&mut deque, deadline - now);
        }

        let value = deque.pop_front().expect("deque is non-empty");
        self.size.store(deque.len(), Ordering::Relaxed);
        self.counters.record_pop();
        self.not_full.notify_one();
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(10);

    #[test]
    fn push_pop_is_fifo() {
        let q = DequeQueue::new("fifo", 4);
        for i in 0..4 {
            q.push(i, SHORT).unwrap();
        }
        for i in 0..4 {
            assert_eq!(q.pop(SHORT).unwrap(), i);
        }
    }

    #[test]
    fn push_to_full_queue_times_out() {
        let q = DequeQueue::new("full", 2);
        q.push(1, SHORT).unwrap();
        q.push(2, SHORT).unwrap();
        assert!(!q.can_push());

        let err = q.push(3, SHORT).unwrap_err();
        assert_eq!(err.operation, "push");
        assert_eq!(q.stats().push_timeouts, 1);
    }

    #[test]
    fn pop_from_empty_queue_times_out() {
        let q: DequeQueue<i32> = DequeQueue::new("empty", 2);
        assert!(q.pop(Duration::ZERO).is_err());
        assert_eq!(q.stats().pop_timeouts, 1);
    }

    #[test]
    fn blocked_push_wakes_on_pop() {
        let q = Arc::new(DequeQueue::new("wake", 1));
        q.push(1, SHORT).unwrap();

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(2, Duration::from_secs(2)))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.pop(SHORT).unwrap(), 1);
        producer.join().unwrap().unwrap();
        assert_eq!(q.pop(SHORT).unwrap(), 2);
    }

    #[test]
    fn try_forms_do_not_raise() {
        let q = DequeQueue::new("try", 1);
        assert!(q.try_push(1, Duration::ZERO));
        assert!(!q.try_push(2, Duration::ZERO));
        assert_eq!(q.try_pop(Duration::ZERO), Some(1));
        assert_eq!(q.try_pop(Duration::ZERO), None);
    }

    #[test]
    fn size_tracks_pushes_and_pops() {
        let q = DequeQueue::new("size", 8);
        assert_eq!(q.len(), 0);
        q.push(1, SHORT).unwrap();
        q.push(2, SHORT).unwrap();
        assert_eq!(q.len(), 2);
        q.pop(SHORT).unwrap();
        assert_eq!(q.len(), 1);
        assert!(q.len() <= q.capacity());
    }
}
