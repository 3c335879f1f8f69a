//! Consumed interface of the host queue system.
//!
//! The host owns queues, the delayed schedule and worker bookkeeping; this
//! crate only observes and nudges them. Everything the uniqueness layer
//! needs from the host fits in this trait: content-addressed removal for
//! the filtered dequeue, full-queue and schedule snapshots for auditing and
//! recovery, and the working set for performing-lock reconciliation.
//!
//! A host without one of the optional views (say, no delayed schedule)
//! returns `LockError::Unsupported` and the callers degrade gracefully.

use async_trait::async_trait;

use crate::error::LockResult;
use crate::types::QueuedItem;

#[cfg(feature = "memory")]
pub use self::memory::MemoryHost;

/// Narrow interface of the host queue system
#[async_trait]
pub trait HostQueue: Send + Sync {
    /// Push a raw item onto its queue
    async fn push(&self, queue: &str, item: QueuedItem) -> LockResult<()>;

    /// Remove one occurrence of `item` from `queue` by content. Returns
    /// whether anything was removed - false means another process got
    /// there first.
    async fn remove_item(&self, queue: &str, item: &QueuedItem) -> LockResult<bool>;

    /// Snapshot of every item currently in `queue`, front first
    async fn everything_in_queue(&self, queue: &str) -> LockResult<Vec<QueuedItem>>;

    /// Names of every live queue
    async fn active_queues(&self) -> LockResult<Vec<String>>;

    /// Snapshot of every item parked in the delayed schedule
    async fn scheduled_items(&self) -> LockResult<Vec<QueuedItem>>;

    /// Snapshot of every item a worker is actively processing
    async fn working_items(&self) -> LockResult<Vec<QueuedItem>>;
}

#[cfg(feature = "memory")]
mod memory {
    use super::*;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct HostInner {
        queues: HashMap<String, VecDeque<QueuedItem>>,
        scheduled: Vec<QueuedItem>,
        working: Vec<QueuedItem>,
    }

    /// In-memory [`HostQueue`] for testing and development
    pub struct MemoryHost {
        inner: RwLock<HostInner>,
    }

    impl MemoryHost {
        pub fn new() -> Self {
            Self {
                inner: RwLock::new(HostInner::default()),
            }
        }

        /// Park an item in the delayed schedule
        pub fn schedule(&self, item: QueuedItem) {
            self.inner.write().scheduled.push(item);
        }

        /// Move a scheduled item into its queue, as the host scheduler
        /// would at its due time. Returns whether the item was scheduled.
        pub fn promote_scheduled(&self, item: &QueuedItem) -> bool {
            let mut inner = self.inner.write();
            match inner.scheduled.iter().position(|candidate| candidate == item) {
                Some(index) => {
                    let item = inner.scheduled.remove(index);
                    inner
                        .queues
                        .entry(item.queue.clone())
                        .or_default()
                        .push_back(item);
                    true
                }
                None => false,
            }
        }

        /// Record an item as actively processing
        pub fn begin_working(&self, item: QueuedItem) {
            self.inner.write().working.push(item);
        }

        /// Drop an item from the working set
        pub fn finish_working(&self, item: &QueuedItem) {
            self.inner
                .write()
                .working
                .retain(|candidate| candidate != item);
        }

        /// Number of items currently in `queue`
        pub fn queue_len(&self, queue: &str) -> usize {
            self.inner
                .read()
                .queues
                .get(queue)
                .map(VecDeque::len)
                .unwrap_or(0)
        }
    }

    impl Default for MemoryHost {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl HostQueue for MemoryHost {
        async fn push(&self, queue: &str, item: QueuedItem) -> LockResult<()> {
            self.inner
                .write()
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(item);
            Ok(())
        }

        async fn remove_item(&self, queue: &str, item: &QueuedItem) -> LockResult<bool> {
            let mut inner = self.inner.write();
            match inner.queues.get_mut(queue) {
                Some(items) => match items.iter().position(|candidate| candidate == item) {
                    Some(index) => {
                        items.remove(index);
                        Ok(true)
                    }
                    None => Ok(false),
                },
                None => Ok(false),
            }
        }

        async fn everything_in_queue(&self, queue: &str) -> LockResult<Vec<QueuedItem>> {
            Ok(self
                .inner
                .read()
                .queues
                .get(queue)
                .map(|items| items.iter().cloned().collect())
                .unwrap_or_default())
        }

        async fn active_queues(&self) -> LockResult<Vec<String>> {
            let inner = self.inner.read();
            Ok(inner
                .queues
                .iter()
                .filter(|(_, items)| !items.is_empty())
                .map(|(name, _)| name.clone())
                .collect())
        }

        async fn scheduled_items(&self) -> LockResult<Vec<QueuedItem>> {
            Ok(self.inner.read().scheduled.clone())
        }

        async fn working_items(&self) -> LockResult<Vec<QueuedItem>> {
            Ok(self.inner.read().working.clone())
        }
    }

}
