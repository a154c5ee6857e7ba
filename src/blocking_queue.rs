//! Thread-safe bounded FIFO with an async "blocking" push alongside a
//! non-blocking `try_push`, wrapping [`BoundedRing`] in a mutex plus a
//! not-full condition. Used to correlate accepted ingress connections
//! awaiting dispatch on a single [`crate::forwarder::Forwarder`].

use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use crate::ring::BoundedRing;

pub struct BlockingBoundedQueue<T> {
    inner: Mutex<BoundedRing<T>>,
    not_full: Notify,
    not_empty: Notify,
}

impl<T> BlockingBoundedQueue<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(BlockingBoundedQueue {
            inner: Mutex::new(BoundedRing::new(capacity)),
            not_full: Notify::new(),
            not_empty: Notify::new(),
        })
    }

    /// Blocks (asynchronously) until there is room, then pushes.
    pub async fn push(&self, mut item: T) {
        loop {
            {
                let mut guard = self.inner.lock().await;
                if guard.len() < guard.capacity() {
                    guard.push(item);
                    drop(guard);
                    self.not_empty.notify();
                    return;
                }
            }
            self.not_full.notified().await;
            // Loop back and retry; item was never consumed so it is
            // still ours to push once a slot is free.
            let _ = &mut item;
        }
    }

    /// Attempts to push without blocking. Returns the item back on failure.
    pub async fn try_push(&self, item: T) -> Result<(), T> {
        let mut guard = self.inner.lock().await;
        if guard.len() < guard.capacity() {
            guard.push(item);
            drop(guard);
            self.not_empty.notify();
            Ok(())
        } else {
            Err(item)
        }
    }

    /// Blocks (asynchronously) until an item is available, then pops it.
    pub async fn recv(&self) -> T {
        loop {
            {
                let mut guard = self.inner.lock().await;
                if let Some(item) = guard.pop() {
                    drop(guard);
                    self.not_full.notify();
                    return item;
                }
            }
            self.not_empty.notified().await;
        }
    }

    /// Never blocks; returns `None` if empty.
    pub async fn pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().await;
        let item = guard.pop();
        drop(guard);
        if item.is_some() {
            self.not_full.notify();
        }
        item
    }

    pub async fn clear(&self) {
        let mut guard = self.inner.lock().await;
        guard.clear();
        drop(guard);
        self.not_full.notify();
        self.not_empty.notify();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn try_push_fails_when_full() {
        let q = BlockingBoundedQueue::new(2);
        q.try_push(1).await.unwrap();
        q.try_push(2).await.unwrap();
        assert_eq!(q.try_push(3).await, Err(3));
    }

    #[tokio::test]
    async fn pop_on_empty_returns_none() {
        let q: Arc<BlockingBoundedQueue<i32>> = BlockingBoundedQueue::new(2);
        assert_eq!(q.pop().await, None);
    }

    #[tokio::test]
    async fn push_blocks_until_pop_frees_space() {
        let q = BlockingBoundedQueue::new(1);
        q.try_push(1).await.unwrap();

        let q2 = q.clone();
        let pusher = tokio::spawn(async move {
            q2.push(2).await;
        });

        // Give the pusher a chance to observe the full queue and start waiting.
        tokio::time::delay_for(Duration::from_millis(20)).await;
        assert_eq!(q.pop().await, Some(1));

        tokio::time::timeout(Duration::from_secs(1), pusher)
            .await
            .expect("push should have unblocked")
            .unwrap();
        assert_eq!(q.pop().await, Some(2));
    }

    #[tokio::test]
    async fn recv_blocks_until_an_item_is_pushed() {
        let q: Arc<BlockingBoundedQueue<i32>> = BlockingBoundedQueue::new(2);
        let q2 = q.clone();
        let receiver = tokio::spawn(async move { q2.recv().await });

        tokio::time::delay_for(Duration::from_millis(20)).await;
        q.try_push(7).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("recv should have unblocked")
            .unwrap();
        assert_eq!(got, 7);
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let q = BlockingBoundedQueue::new(4);
        for i in 0..4 {
            q.try_push(i).await.unwrap();
        }
        let mut drained = Vec::new();
        while let Some(item) = q.pop().await {
            drained.push(item);
        }
        assert_eq!(drained, vec![0, 1, 2, 3]);
    }
}
