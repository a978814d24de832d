//! Delay queue feeding the executor workers
//!
//! A single shared queue of items that become due at a wall-clock instant.
//! Workers block on `pop` until the earliest entry is due; `push` wakes any
//! waiter so a freshly enqueued immediate item is picked up without polling.

use chrono::{DateTime, Utc};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;

struct QueueEntry<T> {
    not_before: DateTime<Utc>,
    seq: u64,
    item: T,
}

impl<T> PartialEq for QueueEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.not_before == other.not_before && self.seq == other.seq
    }
}

impl<T> Eq for QueueEntry<T> {}

impl<T> PartialOrd for QueueEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueueEntry<T> {
    // Reversed so the BinaryHeap surfaces the earliest entry; ties fall back
    // to insertion order.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .not_before
            .cmp(&self.not_before)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum Wait<T> {
    Ready(T),
    Until(DateTime<Utc>),
    Empty,
}

/// Time-ordered queue with blocking pop.
pub struct DelayQueue<T> {
    heap: Mutex<BinaryHeap<QueueEntry<T>>>,
    notify: Notify,
    seq: AtomicU64,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Enqueue an item that is due immediately.
    pub async fn push(&self, item: T) {
        self.push_at(item, Utc::now()).await;
    }

    /// Enqueue an item that becomes due at `not_before`.
    pub async fn push_at(&self, item: T, not_before: DateTime<Utc>) {
        let entry = QueueEntry {
            not_before,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            item,
        };
        self.heap.lock().await.push(entry);
        self.notify.notify_waiters();
    }

    /// Wait until an entry is due and remove it.
    pub async fn pop(&self) -> T {
        loop {
            // The notified future must exist before the heap is inspected,
            // otherwise a push between inspection and await is lost.
            let notified = self.notify.notified();
            let wait = {
                let mut heap = self.heap.lock().await;
                match heap.peek() {
                    None => Wait::Empty,
                    Some(entry) if entry.not_before > Utc::now() => Wait::Until(entry.not_before),
                    Some(_) => match heap.pop() {
                        Some(entry) => Wait::Ready(entry.item),
                        None => Wait::Empty,
                    },
                }
            };
            match wait {
                Wait::Ready(item) => return item,
                Wait::Until(at) => {
                    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = notified => {}
                    }
                }
                Wait::Empty => notified.await,
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.heap.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_pop_returns_earliest_entry_first() {
        let queue = DelayQueue::new();
        let now = Utc::now();
        queue.push_at("late", now + ChronoDuration::milliseconds(40)).await;
        queue.push_at("early", now).await;

        assert_eq!(queue.pop().await, "early");
        assert_eq!(queue.pop().await, "late");
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_same_instant_preserves_insertion_order() {
        let queue = DelayQueue::new();
        let now = Utc::now();
        queue.push_at(1, now).await;
        queue.push_at(2, now).await;
        queue.push_at(3, now).await;

        assert_eq!(queue.pop().await, 1);
        assert_eq!(queue.pop().await, 2);
        assert_eq!(queue.pop().await, 3);
    }

    #[tokio::test]
    async fn test_pop_waits_until_entry_is_due() {
        let queue = DelayQueue::new();
        let start = tokio::time::Instant::now();
        queue
            .push_at((), Utc::now() + ChronoDuration::milliseconds(60))
            .await;

        queue.pop().await;
        assert!(start.elapsed() >= std::time::Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_push_wakes_blocked_pop() {
        let queue = std::sync::Arc::new(DelayQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push("item").await;

        let popped = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("pop should wake")
            .expect("pop task should not panic");
        assert_eq!(popped, "item");
    }
}
