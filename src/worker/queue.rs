//! Three-level strict-priority FIFO queue.
//!
//! Dequeue always prefers the highest non-empty priority; within one
//! priority, submission order is preserved. Capacity covers all levels
//! together.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::dispatch::Priority;

struct Levels<T> {
    high: VecDeque<T>,
    normal: VecDeque<T>,
    low: VecDeque<T>,
}

impl<T> Levels<T> {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }
}

/// Bounded priority queue with async pop.
pub struct PriorityQueue<T> {
    levels: Mutex<Levels<T>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl<T> PriorityQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            levels: Mutex::new(Levels {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
            }),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue. Returns the item back when the queue is full or closed.
    pub fn push(&self, priority: Priority, item: T) -> Result<(), T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(item);
        }
        {
            let mut levels = self.levels.lock();
            if levels.len() >= self.capacity {
                return Err(item);
            }
            match priority {
                Priority::High => levels.high.push_back(item),
                Priority::Normal => levels.normal.push_back(item),
                Priority::Low => levels.low.push_back(item),
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue the next item, waiting for one to arrive. Returns `None`
    /// once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);

            {
                let mut levels = self.levels.lock();
                if let Some(item) = levels
                    .high
                    .pop_front()
                    .or_else(|| levels.normal.pop_front())
                    .or_else(|| levels.low.pop_front())
                {
                    if levels.len() > 0 {
                        // Other consumers may be parked on the same edge.
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting pushes and wake every parked consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.levels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue depth per priority: [high, normal, low].
    pub fn len_by_priority(&self) -> [usize; 3] {
        let levels = self.levels.lock();
        [levels.high.len(), levels.normal.len(), levels.low.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn strict_priority_order() {
        let queue = PriorityQueue::new(16);
        queue.push(Priority::Low, "low-1").unwrap();
        queue.push(Priority::Normal, "normal-1").unwrap();
        queue.push(Priority::High, "high-1").unwrap();
        queue.push(Priority::Normal, "normal-2").unwrap();

        assert_eq!(queue.pop().await, Some("high-1"));
        assert_eq!(queue.pop().await, Some("normal-1"));
        assert_eq!(queue.pop().await, Some("normal-2"));
        assert_eq!(queue.pop().await, Some("low-1"));
    }

    #[tokio::test]
    async fn capacity_is_shared_across_levels() {
        let queue = PriorityQueue::new(2);
        queue.push(Priority::Low, 1).unwrap();
        queue.push(Priority::High, 2).unwrap();
        assert_eq!(queue.push(Priority::Normal, 3), Err(3));
        assert_eq!(queue.len_by_priority(), [1, 0, 1]);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = PriorityQueue::new(4);
        queue.push(Priority::Normal, 1).unwrap();
        queue.close();
        assert!(queue.push(Priority::Normal, 2).is_err());
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = std::sync::Arc::new(PriorityQueue::new(4));
        let consumer = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(Priority::Normal, 42).unwrap();
        assert_eq!(consumer.await.unwrap(), Some(42));
    }
}
