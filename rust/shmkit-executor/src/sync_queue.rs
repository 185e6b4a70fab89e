use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Unbounded in-process FIFO whose `pop` blocks until an element arrives.
#[derive(Debug, Default)]
pub struct SyncQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> SyncQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.notify_one();
    }

    /// Append every element in order, waking one consumer per element.
    pub fn push_all(&self, items: impl IntoIterator<Item = T>) {
        let mut queue = self.items.lock();
        for item in items {
            queue.push_back(item);
            self.available.notify_one();
        }
    }

    pub fn pop(&self) -> T {
        let mut queue = self.items.lock();
        loop {
            if let Some(item) = queue.pop_front() {
                return item;
            }
            self.available.wait(&mut queue);
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn pop_blocks_until_push() {
        let queue = Arc::new(SyncQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || (queue.pop(), queue.pop(), queue.pop()))
        };
        queue.push(1);
        queue.push_all([2, 3]);
        assert_eq!(consumer.join().unwrap(), (1, 2, 3));
        assert!(queue.is_empty());
        assert_eq!(queue.try_pop(), None);
    }
}
