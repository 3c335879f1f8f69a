//! Per-queue recovering buffer.
//!
//! Several bookkeeping steps happen between "item popped off its queue" and
//! "item recorded as actively processing": queueing-lock release,
//! performing-lock acquire. A process killed inside that window loses the
//! job while its uniqueness lock may stay held. The buffer closes the
//! window: the raw item is written here, tagged with a fresh token and the
//! current time, before any further processing, and removed the moment the
//! handoff is confirmed. A sweep restores anything that sat in the buffer
//! past the allowed delay.
//!
//! Only queues in the allowed set participate; everything else passes
//! through untouched.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::codec::{KeyCodec, ALLOWED_QUEUES_KEY};
use crate::error::LockResult;
use crate::store::{LockStore, StoreOp, StoreReply};
use crate::types::{QueuedItem, RecoveringItem};

/// Staging area closing the crash window between dequeue and worker handoff
pub struct RecoveringBuffer<S: LockStore + ?Sized> {
    store: Arc<S>,
    codec: KeyCodec,
    allowed_delay: Duration,
}

impl<S: LockStore + ?Sized> RecoveringBuffer<S> {
    /// Create a buffer. `allowed_delay` is how long an entry may sit here
    /// before a sweep treats it as lost.
    pub fn new(store: Arc<S>, codec: KeyCodec, allowed_delay: Duration) -> Self {
        Self {
            store,
            codec,
            allowed_delay,
        }
    }

    /// Opt a queue into recovery
    pub async fn allow_queue(&self, queue: &str) -> LockResult<()> {
        self.store.sadd(ALLOWED_QUEUES_KEY, queue).await
    }

    /// Whether a queue participates in recovery
    pub async fn allowed(&self, queue: &str) -> LockResult<bool> {
        let queues = self.store.smembers(ALLOWED_QUEUES_KEY).await?;
        Ok(queues.iter().any(|candidate| candidate == queue))
    }

    /// Names of every queue opted into recovery
    pub async fn allowed_queues(&self) -> LockResult<Vec<String>> {
        self.store.smembers(ALLOWED_QUEUES_KEY).await
    }

    /// Record an item the instant it leaves its queue. No-op for queues
    /// outside the allowed set.
    pub async fn push(&self, queue: &str, item: &QueuedItem) -> LockResult<()> {
        if !self.allowed(queue).await? {
            return Ok(());
        }

        let entry = RecoveringItem::tag(item.clone());
        let member = self.codec.encode_recovering(&entry)?;
        let key = self.codec.recovering_queue_key(queue);
        self.store
            .zadd(&key, chrono::Utc::now().timestamp(), &member)
            .await?;

        info!(
            "Pushed item to the recovering buffer. Queue: {}. Item: {}",
            queue, item
        );
        Ok(())
    }

    /// Remove an item once its handoff is confirmed (or it went back to
    /// the queue). Entries are matched by item content, not by token, so
    /// this stays correct whichever copy of the item the caller holds.
    pub async fn remove(&self, queue: &str, item: &QueuedItem) -> LockResult<()> {
        let key = self.codec.recovering_queue_key(queue);
        let members = self.store.zrange_up_to(&key, i64::MAX).await?;

        for member in members {
            let entry = self.codec.decode_recovering(&member)?;
            if entry.item == *item {
                self.store.zrem(&key, &member).await?;
                info!(
                    "Removed item from the recovering buffer. Queue: {}. Item: {}",
                    queue, item
                );
                return Ok(());
            }
        }

        debug!(
            "No recovering entry to remove. Queue: {}. Item: {}",
            queue, item
        );
        Ok(())
    }

    /// Whether an item currently sits in the buffer for `queue`
    pub async fn contains(&self, queue: &str, item: &QueuedItem) -> LockResult<bool> {
        let key = self.codec.recovering_queue_key(queue);
        let members = self.store.zrange_up_to(&key, i64::MAX).await?;
        for member in members {
            if self.codec.decode_recovering(&member)?.item == *item {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Atomically take every entry of `queue` older than the allowed
    /// delay: read and remove happen in one batch, so two concurrent
    /// sweepers cannot both obtain an entry.
    pub async fn sweep(&self, queue: &str) -> LockResult<Vec<QueuedItem>> {
        let key = self.codec.recovering_queue_key(queue);
        let cutoff = chrono::Utc::now().timestamp() - self.allowed_delay.as_secs() as i64;

        let replies = self
            .store
            .batch(vec![
                StoreOp::ZRangeUpTo {
                    set: key.clone(),
                    max: cutoff,
                },
                StoreOp::ZRemRangeUpTo { set: key, max: cutoff },
            ])
            .await?;

        let members = match replies.into_iter().next() {
            Some(StoreReply::Values(members)) => members,
            _ => Vec::new(),
        };

        let mut items = Vec::with_capacity(members.len());
        for member in members {
            items.push(self.codec.decode_recovering(&member)?.item);
        }

        if !items.is_empty() {
            info!(
                "Found overdue jobs in the recovering buffer. Queue: {}. Count: {}",
                queue,
                items.len()
            );
        }
        Ok(items)
    }

    /// Sweep every allowed queue, returning (queue, item) pairs of every
    /// overdue entry taken
    pub async fn sweep_all(&self) -> LockResult<Vec<(String, QueuedItem)>> {
        let mut recovered = Vec::new();
        for queue in self.allowed_queues().await? {
            for item in self.sweep(&queue).await? {
                recovered.push((queue.clone(), item));
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn buffer(store: Arc<MemoryStore>, allowed_delay: Duration) -> RecoveringBuffer<MemoryStore> {
        RecoveringBuffer::new(store, KeyCodec::new("unique_jobs"), allowed_delay)
    }

    fn item(n: i64) -> QueuedItem {
        QueuedItem::new("TestJob", vec![json!(n)], "default")
    }

    #[tokio::test]
    async fn push_skips_queues_outside_the_allowed_set() {
        let store = Arc::new(MemoryStore::new());
        let buffer = buffer(store, Duration::from_secs(3));

        buffer.push("default", &item(1)).await.unwrap();
        assert!(!buffer.contains("default", &item(1)).await.unwrap());

        buffer.allow_queue("default").await.unwrap();
        buffer.push("default", &item(1)).await.unwrap();
        assert!(buffer.contains("default", &item(1)).await.unwrap());
    }

    #[tokio::test]
    async fn remove_matches_by_item_content() {
        let store = Arc::new(MemoryStore::new());
        let buffer = buffer(store, Duration::from_secs(3));
        buffer.allow_queue("default").await.unwrap();

        buffer.push("default", &item(1)).await.unwrap();
        buffer.push("default", &item(2)).await.unwrap();

        // The caller's copy carries no token; content matching finds it
        buffer.remove("default", &item(1)).await.unwrap();

        assert!(!buffer.contains("default", &item(1)).await.unwrap());
        assert!(buffer.contains("default", &item(2)).await.unwrap());
    }

    #[tokio::test]
    async fn remove_of_absent_item_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let buffer = buffer(store, Duration::from_secs(3));
        buffer.allow_queue("default").await.unwrap();

        buffer.remove("default", &item(1)).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_takes_only_overdue_entries() {
        let store = Arc::new(MemoryStore::new());
        let buffer = buffer(store.clone(), Duration::from_secs(0));
        buffer.allow_queue("default").await.unwrap();

        buffer.push("default", &item(1)).await.unwrap();

        // An allowed delay of zero makes the entry overdue immediately
        let swept = buffer.sweep("default").await.unwrap();
        assert_eq!(swept, vec![item(1)]);
        assert!(!buffer.contains("default", &item(1)).await.unwrap());
    }

    #[tokio::test]
    async fn fresh_entries_survive_a_sweep() {
        let store = Arc::new(MemoryStore::new());
        let buffer = buffer(store, Duration::from_secs(60));
        buffer.allow_queue("default").await.unwrap();

        buffer.push("default", &item(1)).await.unwrap();
        assert!(buffer.sweep("default").await.unwrap().is_empty());
        assert!(buffer.contains("default", &item(1)).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_sweeps_take_each_entry_once() {
        let store = Arc::new(MemoryStore::new());
        let buffer = Arc::new(RecoveringBuffer::new(
            store,
            KeyCodec::new("unique_jobs"),
            Duration::from_secs(0),
        ));
        buffer.allow_queue("default").await.unwrap();
        buffer.push("default", &item(1)).await.unwrap();

        let a = tokio::spawn({
            let buffer = buffer.clone();
            async move { buffer.sweep("default").await.unwrap() }
        });
        let b = tokio::spawn({
            let buffer = buffer.clone();
            async move { buffer.sweep("default").await.unwrap() }
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a.len() + b.len(), 1);
    }
}
