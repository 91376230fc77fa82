//! Thread-safe FIFO used by the dispatch, retry and response planes.
//!
//! A mutex-protected deque with condvar signaling. Producers never block;
//! consumers either poll or wait with a deadline. The response queue relies
//! on the total FIFO order this provides.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
pub struct TsQueue<T> {
    inner: Mutex<VecDeque<T>>,
    cond: Condvar,
}

impl<T> Default for TsQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TsQueue<T> {
    pub fn new() -> Self {
        TsQueue {
            inner: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    /// Append an element and wake one waiting consumer.
    pub fn push(&self, value: T) {
        self.inner.lock().push_back(value);
        self.cond.notify_one();
    }

    /// Pop the oldest element, without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Pop the oldest element, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock();
        if let Some(value) = inner.pop_front() {
            return Some(value);
        }
        self.cond.wait_for(&mut inner, timeout);
        inner.pop_front()
    }

    /// Take every queued element at once.
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = TsQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn pop_timeout_wakes_on_push() {
        let q = Arc::new(TsQueue::new());
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.push(42u32);
            })
        };
        let got = q.pop_timeout(Duration::from_secs(5));
        producer.join().unwrap();
        assert_eq!(got, Some(42));
    }

    #[test]
    fn pop_timeout_expires_empty() {
        let q: TsQueue<u8> = TsQueue::new();
        assert_eq!(q.pop_timeout(Duration::from_millis(10)), None);
    }
}
