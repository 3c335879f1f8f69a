//! Lock auditing: reconciles held locks against queue, schedule and worker
//! state.
//!
//! A read-only operational pass, not a correctness mechanism. The locking
//! system is dynamic - a job can legitimately move between queue, schedule
//! and worker mid-scan, and lock state is read at a different instant than
//! queue membership - so candidate "unreleased" locks are re-confirmed
//! against the live lock set a bounded number of times with small delays.
//! The candidate set is non-increasing across rounds, so this converges.
//!
//! Garbage needs no reconfirmation: a registry member whose key is gone is
//! unambiguous (the key expired, or someone deleted it out-of-band).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::codec::{KeyCodec, LockPurpose};
use crate::error::{LockError, LockResult};
use crate::host::HostQueue;
use crate::store::LockStore;
use crate::types::QueuedItem;

/// Read-only reconciliation of lock state against host state
pub struct LockAuditor<S: LockStore + ?Sized, H: HostQueue + ?Sized> {
    store: Arc<S>,
    host: Arc<H>,
    codec: KeyCodec,
    reconfirm_rounds: u32,
    reconfirm_delay: Duration,
}

impl<S: LockStore + ?Sized, H: HostQueue + ?Sized> LockAuditor<S, H> {
    /// Create an auditor over a store/host pair
    pub fn new(
        store: Arc<S>,
        host: Arc<H>,
        codec: KeyCodec,
        reconfirm_rounds: u32,
        reconfirm_delay: Duration,
    ) -> Self {
        Self {
            store,
            host,
            codec,
            reconfirm_rounds,
            reconfirm_delay,
        }
    }

    /// Queueing locks held for jobs that are in no queue and not in the
    /// delayed schedule
    pub async fn unreleased_queueing_locks(&self) -> LockResult<Vec<QueuedItem>> {
        self.unreleased(LockPurpose::Queueing).await
    }

    /// Performing locks held for jobs no worker is actually processing
    pub async fn unreleased_performing_locks(&self) -> LockResult<Vec<QueuedItem>> {
        self.unreleased(LockPurpose::Performing).await
    }

    /// Queueing-registry members whose lock key no longer exists
    pub async fn queueing_lock_garbage(&self) -> LockResult<Vec<String>> {
        self.garbage(LockPurpose::Queueing).await
    }

    /// Performing-registry members whose lock key no longer exists
    pub async fn performing_lock_garbage(&self) -> LockResult<Vec<String>> {
        self.garbage(LockPurpose::Performing).await
    }

    async fn unreleased(&self, purpose: LockPurpose) -> LockResult<Vec<QueuedItem>> {
        let mut candidates = self.diff_against_host(purpose, None).await?;

        for round in 0..self.reconfirm_rounds {
            if candidates.is_empty() {
                break;
            }
            tokio::time::sleep(self.reconfirm_delay).await;
            candidates = self.diff_against_host(purpose, Some(&candidates)).await?;
            debug!(
                "Audit round {} left {} {} candidates",
                round + 1,
                candidates.len(),
                purpose
            );
        }

        candidates
            .into_iter()
            .map(|encoded| self.codec.decode_item(&encoded))
            .collect()
    }

    /// One pass of (live locked items) minus (items observed in the host),
    /// optionally intersected with the previous round's candidates
    async fn diff_against_host(
        &self,
        purpose: LockPurpose,
        previous: Option<&HashSet<String>>,
    ) -> LockResult<HashSet<String>> {
        let locked = self.live_locked_payloads(purpose).await?;
        let observed = self.host_payloads(purpose).await?;

        Ok(locked
            .into_iter()
            .filter(|payload| !observed.contains(payload))
            .filter(|payload| previous.map(|set| set.contains(payload)).unwrap_or(true))
            .collect())
    }

    /// Payloads of every registry member whose key still exists
    async fn live_locked_payloads(&self, purpose: LockPurpose) -> LockResult<HashSet<String>> {
        let keys = self.store.smembers(&self.codec.registry_key(purpose)).await?;
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let values = self.store.mget(&keys).await?;
        Ok(values.into_iter().flatten().collect())
    }

    /// Encoded items currently observable in the host for this purpose:
    /// queues plus schedule for queueing, the working set for performing
    async fn host_payloads(&self, purpose: LockPurpose) -> LockResult<HashSet<String>> {
        let items = match purpose {
            LockPurpose::Queueing => {
                let mut items = Vec::new();
                for queue in self.host.active_queues().await? {
                    items.extend(self.host.everything_in_queue(&queue).await?);
                }
                match self.host.scheduled_items().await {
                    Ok(scheduled) => items.extend(scheduled),
                    // A host without a delayed schedule simply has nothing
                    // scheduled
                    Err(LockError::Unsupported(_)) => {}
                    Err(err) => return Err(err),
                }
                items
            }
            LockPurpose::Performing => self.host.working_items().await?,
        };

        items
            .iter()
            .map(|item| self.codec.encode_item(item))
            .collect()
    }

    async fn garbage(&self, purpose: LockPurpose) -> LockResult<Vec<String>> {
        let keys = self.store.smembers(&self.codec.registry_key(purpose)).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values = self.store.mget(&keys).await?;
        let mut garbage: Vec<String> = keys
            .into_iter()
            .zip(values)
            .filter(|(_, value)| value.is_none())
            .map(|(key, _)| key)
            .collect();
        garbage.sort();
        Ok(garbage)
    }
}
