use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Blocking FIFO with a fixed capacity.
///
/// `put` waits while the queue is full and `get` waits while it is empty.
/// Once closed, `put` hands the item back and `get` drains what is left and
/// then returns `None`.
pub struct BoundedQueue<T> {
    name: String,
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    high_water_mark: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                high_water_mark: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put(&self, item: T) -> Result<(), T> {
        let mut state = self.lock();
        while state.items.len() >= self.capacity && !state.closed {
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        state.high_water_mark = state.high_water_mark.max(state.items.len());
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn get(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// Read-only view of a queue, independent of its item type.
pub trait QueueProbe: Send + Sync {
    fn name(&self) -> &str;
    fn capacity(&self) -> usize;
    fn len(&self) -> usize;
    fn high_water_mark(&self) -> usize;
    fn is_closed(&self) -> bool;
    fn close(&self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send> QueueProbe for BoundedQueue<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.lock().items.len()
    }

    fn high_water_mark(&self) -> usize {
        self.lock().high_water_mark
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn close(&self) {
        BoundedQueue::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn put_blocks_until_space_is_available() {
        let queue = Arc::new(BoundedQueue::new("test", 1));
        queue.put(1).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.put(2))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.get(), Some(1));
        producer.join().unwrap().unwrap();
        assert_eq!(queue.get(), Some(2));
        assert_eq!(queue.high_water_mark(), 1);
    }

    #[test]
    fn closed_queue_drains_then_ends() {
        let queue = BoundedQueue::new("test", 4);
        queue.put("a").unwrap();
        queue.close();

        assert_eq!(queue.put("b"), Err("b"));
        assert_eq!(queue.get(), Some("a"));
        assert_eq!(queue.get(), None);
        assert!(queue.is_closed());
    }

    #[test]
    fn close_wakes_blocked_consumers() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new("test", 2));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.get())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
    }
}
