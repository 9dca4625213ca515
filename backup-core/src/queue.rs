use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Blocking multi-producer multi-consumer queue.
///
/// Workers call [`wait_and_pop`](Self::wait_and_pop) and block until an item
/// arrives or the queue is marked finished, so they can start as soon as the
/// producer (schema scan, zip directory listing) pushes the first item
/// instead of waiting for the whole listing to complete.
pub struct ThreadSafeQueue<T> {
    inner: Mutex<Inner<T>>,
    condition: Condvar,
}

struct Inner<T> {
    queue: VecDeque<T>,
    finished: bool,
}

impl<T> Default for ThreadSafeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ThreadSafeQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { queue: VecDeque::new(), finished: false }),
            condition: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.queue.push_back(item);
        }
        self.condition.notify_one();
    }

    /// Blocks until an item is available or the queue is finished and empty.
    pub fn wait_and_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.queue.pop_front() {
                return Some(item);
            }
            if inner.finished {
                return None;
            }
            inner = self.condition.wait(inner).unwrap();
        }
    }

    /// Signals that no more items will be pushed; wakes every waiting consumer.
    pub fn mark_finished(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.finished = true;
        }
        self.condition.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }
}
