//! Queue for eventually applied cache writes (presence, activity).
//!
//! Commands accumulate until the queue reaches its size threshold or the
//! flush interval elapses; the cache service then sends them in one
//! non-atomic pipeline. A failed flush puts the batch back at the head so
//! order is preserved. During a long outage the queue is bounded: the oldest
//! commands are dropped first.

use chatsync_core::CacheCommand;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

#[derive(Debug)]
pub(crate) struct WriteQueue {
    pending: Mutex<VecDeque<CacheCommand>>,
    full: Notify,
    threshold: usize,
    capacity: usize,
}

impl WriteQueue {
    pub(crate) fn new(threshold: usize, capacity: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            pending: Mutex::new(VecDeque::new()),
            full: Notify::new(),
            threshold,
            capacity: capacity.max(threshold),
        }
    }

    /// Queue commands. Wakes the flusher once the threshold is reached.
    ///
    /// Returns how many of the oldest commands were dropped to stay in capacity.
    pub(crate) fn push(&self, commands: impl IntoIterator<Item = CacheCommand>) -> usize {
        let (depth, dropped) = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.extend(commands);
            let dropped = self.enforce_capacity(&mut pending);
            (pending.len(), dropped)
        };
        if depth >= self.threshold {
            self.full.notify_one();
        }
        dropped
    }

    pub(crate) fn drain(&self) -> Vec<CacheCommand> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// Put a failed batch back ahead of anything queued since. Returns dropped count.
    pub(crate) fn requeue_front(&self, batch: Vec<CacheCommand>) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for command in batch.into_iter().rev() {
            pending.push_front(command);
        }
        self.enforce_capacity(&mut pending)
    }

    fn enforce_capacity(&self, pending: &mut VecDeque<CacheCommand>) -> usize {
        let excess = pending.len().saturating_sub(self.capacity);
        pending.drain(..excess);
        excess
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Resolves when a push crosses the threshold.
    pub(crate) async fn wait_full(&self) {
        self.full.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn del(key: &str) -> CacheCommand {
        CacheCommand::Delete {
            keys: vec![key.to_string()],
        }
    }

    #[test]
    fn requeued_batch_goes_back_in_front_in_order() {
        let queue = WriteQueue::new(10, 100);
        queue.push([del("a"), del("b")]);
        let batch = queue.drain();
        queue.push([del("c")]);

        assert_eq!(queue.requeue_front(batch), 0);

        assert_eq!(queue.drain(), vec![del("a"), del("b"), del("c")]);
    }

    #[test]
    fn overflow_drops_oldest_commands() {
        let queue = WriteQueue::new(2, 3);
        assert_eq!(queue.push([del("a"), del("b"), del("c")]), 0);
        assert_eq!(queue.push([del("d")]), 1);

        assert_eq!(queue.drain(), vec![del("b"), del("c"), del("d")]);
    }

    #[tokio::test]
    async fn reaching_threshold_wakes_the_flusher() {
        let queue = WriteQueue::new(2, 100);
        queue.push([del("a")]);
        queue.push([del("b")]);

        // notify_one stores a permit, so a waiter arriving late still wakes.
        let woke = tokio::time::timeout(std::time::Duration::from_secs(1), queue.wait_full()).await;
        assert!(woke.is_ok());
        assert_eq!(queue.len(), 2);
    }
}
