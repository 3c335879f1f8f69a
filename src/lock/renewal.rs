//! Background renewal of performing-lock TTLs.
//!
//! A performing lock carries a short TTL so a crashed worker's lock
//! self-expires; a live worker keeps it alive by re-extending the TTL on a
//! fixed interval. One task runs per currently-executing job. The task is
//! started when the lock is acquired and stopped two ways: aborted
//! deterministically on release, and self-terminating as soon as it
//! observes the key absent (released or externally cleared).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::LockStore;

/// Registry of running renewal tasks, keyed by lock key
pub struct RenewalRegistry {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RenewalRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start renewing `key` every `interval`, re-extending its TTL to
    /// `ttl`. A task already running for the key is replaced.
    pub fn start(
        &self,
        store: Arc<dyn LockStore>,
        key: String,
        ttl: Duration,
        interval: Duration,
    ) {
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            renew_loop(store, key, ttl, interval).await;
        });
        if let Some(previous) = self.tasks.lock().insert(task_key, handle) {
            previous.abort();
        }
    }

    /// Stop the renewal task for `key`, if one is running
    pub fn stop(&self, key: &str) {
        if let Some(handle) = self.tasks.lock().remove(key) {
            handle.abort();
            debug!("Stopped renewal task for key: {}", key);
        }
    }

    /// Number of currently running renewal tasks
    pub fn active(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.len()
    }
}

impl Default for RenewalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RenewalRegistry {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}

async fn renew_loop(store: Arc<dyn LockStore>, key: String, ttl: Duration, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        match store.exists(&key).await {
            Ok(true) => {
                if let Err(err) = store.expire(&key, ttl).await {
                    warn!("Failed to renew lock {}: {}", key, err);
                } else {
                    debug!("Renewed lock {}", key);
                }
            }
            Ok(false) => {
                debug!("Lock {} is gone, stopping renewal", key);
                break;
            }
            Err(err) => {
                // Transient store trouble: keep the task alive, the lock
                // survives until its current TTL runs out anyway
                warn!("Renewal check failed for {}: {}", key, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::StoreOp;

    async fn set_with_ttl(store: &MemoryStore, key: &str, ttl: Duration) {
        store
            .batch(vec![
                StoreOp::GetSet {
                    key: key.into(),
                    value: "payload".into(),
                },
                StoreOp::Expire { key: key.into(), ttl },
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn renewal_keeps_key_alive_past_its_ttl() {
        let store = Arc::new(MemoryStore::new());
        set_with_ttl(&store, "k", Duration::from_millis(40)).await;

        let registry = RenewalRegistry::new();
        registry.start(
            store.clone(),
            "k".into(),
            Duration::from_millis(40),
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.exists("k").await.unwrap());

        registry.stop("k");
    }

    #[tokio::test]
    async fn renewal_stops_when_key_disappears() {
        let store = Arc::new(MemoryStore::new());
        set_with_ttl(&store, "k", Duration::from_millis(40)).await;

        let registry = RenewalRegistry::new();
        registry.start(
            store.clone(),
            "k".into(),
            Duration::from_millis(40),
            Duration::from_millis(10),
        );

        store.del("k").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(registry.active(), 0);
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn stop_aborts_the_task() {
        let store = Arc::new(MemoryStore::new());
        set_with_ttl(&store, "k", Duration::from_millis(30)).await;

        let registry = RenewalRegistry::new();
        registry.start(
            store.clone(),
            "k".into(),
            Duration::from_millis(30),
            Duration::from_millis(10),
        );
        registry.stop("k");

        // With the task gone, the TTL runs out unrenewed
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(registry.active(), 0);
    }
}
