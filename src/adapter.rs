//! The hook layer the host queue system calls into.
//!
//! The host calls these hooks synchronously at enqueue, schedule, dequeue,
//! handoff, finish and destroy time; everything else (lock state machines,
//! recovery, renewal) hangs off them. Lock races are handled here, as close
//! to the call site as possible: a duplicate enqueue is silently "not
//! enqueued", a duplicate concurrent execution is silently requeued, and a
//! job that has been dequeued is never aborted by a race.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::audit::LockAuditor;
use crate::codec::KeyCodec;
use crate::error::{LockError, LockResult};
use crate::host::HostQueue;
use crate::lock::renewal::RenewalRegistry;
use crate::lock::UniquenessLock;
use crate::recovering::RecoveringBuffer;
use crate::store::LockStore;
use crate::types::{PolicyRegistry, QueuedItem};

/// Where an enqueue request originates.
///
/// Scheduler-triggered transitions from the delayed schedule to a queue are
/// never blocked: the queueing lock taken at schedule time keeps covering
/// the item until dequeue, and re-checking it here would deadlock the
/// handoff against our own lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOrigin {
    /// A client pushing directly to a queue
    Immediate,

    /// The host scheduler promoting a delayed item at its due time
    Scheduler,
}

/// Configuration for the uniqueness layer
#[derive(Debug, Clone)]
pub struct UniquenessConfig {
    /// Namespace every lock key and registry lives under
    pub namespace: String,

    /// TTL of a performing lock between renewals
    pub performing_ttl: Duration,

    /// Interval at which a held performing lock is re-extended
    pub renew_interval: Duration,

    /// Added to the delay-until-run to form a queueing lock's TTL
    pub queueing_ttl_buffer: Duration,

    /// How long an item may sit in the recovering buffer before a sweep
    /// treats it as lost
    pub recovery_allowed_delay: Duration,

    /// Bounded retries for the atomic acquire/release batches
    pub acquire_retries: u32,

    /// Reconfirmation rounds of the audit set-difference
    pub audit_reconfirm_rounds: u32,

    /// Delay between audit reconfirmation rounds
    pub audit_reconfirm_delay: Duration,
}

impl Default for UniquenessConfig {
    fn default() -> Self {
        Self {
            namespace: "unique_jobs".to_string(),
            performing_ttl: Duration::from_secs(60),
            renew_interval: Duration::from_secs(20),
            queueing_ttl_buffer: Duration::from_secs(600),
            recovery_allowed_delay: Duration::from_secs(3),
            acquire_retries: 3,
            audit_reconfirm_rounds: 2,
            audit_reconfirm_delay: Duration::from_millis(100),
        }
    }
}

impl UniquenessConfig {
    /// Set the key namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the performing-lock TTL
    pub fn with_performing_ttl(mut self, ttl: Duration) -> Self {
        self.performing_ttl = ttl;
        self
    }

    /// Set the renewal interval
    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    /// Set the queueing-lock TTL buffer
    pub fn with_queueing_ttl_buffer(mut self, buffer: Duration) -> Self {
        self.queueing_ttl_buffer = buffer;
        self
    }

    /// Set the recovery allowed delay
    pub fn with_recovery_allowed_delay(mut self, delay: Duration) -> Self {
        self.recovery_allowed_delay = delay;
        self
    }
}

/// Uniqueness adapter wired between a lock store and a host queue system
pub struct UniquenessAdapter<S: LockStore + 'static, H: HostQueue + 'static> {
    store: Arc<S>,
    host: Arc<H>,
    config: Arc<UniquenessConfig>,
    policies: PolicyRegistry,
    codec: KeyCodec,
    renewals: Arc<RenewalRegistry>,
    recovering: RecoveringBuffer<S>,
}

impl<S: LockStore + 'static, H: HostQueue + 'static> UniquenessAdapter<S, H> {
    /// Create an adapter with default configuration
    pub fn new(store: Arc<S>, host: Arc<H>, policies: PolicyRegistry) -> Self {
        Self::with_config(store, host, policies, UniquenessConfig::default())
    }

    /// Create an adapter with custom configuration
    pub fn with_config(
        store: Arc<S>,
        host: Arc<H>,
        policies: PolicyRegistry,
        config: UniquenessConfig,
    ) -> Self {
        let codec = KeyCodec::new(config.namespace.clone());
        let recovering = RecoveringBuffer::new(
            store.clone(),
            codec.clone(),
            config.recovery_allowed_delay,
        );
        Self {
            store,
            host,
            config: Arc::new(config),
            policies,
            codec,
            renewals: Arc::new(RenewalRegistry::new()),
            recovering,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &UniquenessConfig {
        &self.config
    }

    /// Get the recovering buffer
    pub fn recovering(&self) -> &RecoveringBuffer<S> {
        &self.recovering
    }

    /// Build an auditor over this adapter's store and host
    pub fn auditor(&self) -> LockAuditor<S, H> {
        LockAuditor::new(
            self.store.clone(),
            self.host.clone(),
            self.codec.clone(),
            self.config.audit_reconfirm_rounds,
            self.config.audit_reconfirm_delay,
        )
    }

    /// Lock handle for an item, honoring the class's policy
    pub fn lock_for(&self, item: &QueuedItem) -> LockResult<UniquenessLock<S>> {
        let policy = self.policies.policy_for(&item.class);
        let identity = self.policies.identity_for(item);
        let encoded = match &policy.key_override {
            Some(key) => key(&identity),
            None => self.codec.encode_identity(&identity)?,
        };
        Ok(UniquenessLock::new(
            self.store.clone(),
            self.codec.clone(),
            self.config.clone(),
            policy.variant,
            item.clone(),
            encoded,
        ))
    }

    /// Consulted before the host adds an item to the immediate queue.
    /// Acquires the queueing lock when the class wants one; `false` means
    /// a duplicate is already queued or scheduled and the item must not be
    /// enqueued (not an error).
    #[instrument(skip(self, item), fields(class = %item.class, queue = %item.queue))]
    pub async fn before_enqueue(
        &self,
        item: &QueuedItem,
        origin: EnqueueOrigin,
    ) -> LockResult<bool> {
        if origin == EnqueueOrigin::Scheduler {
            return Ok(true);
        }

        let lock = self.lock_for(item)?;
        match lock.try_lock_queueing(Duration::ZERO).await {
            Ok(()) => Ok(true),
            Err(LockError::AlreadyLocked(_)) => {
                debug!("Duplicate enqueue skipped for {}", item);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Consulted before the host adds an item to the delayed schedule.
    /// `delay` is how far in the future the item is due; the queueing lock
    /// expires after the delay plus the configured buffer.
    #[instrument(skip(self, item), fields(class = %item.class, queue = %item.queue))]
    pub async fn before_schedule(&self, item: &QueuedItem, delay: Duration) -> LockResult<bool> {
        let lock = self.lock_for(item)?;
        match lock.try_lock_queueing(delay).await {
            Ok(()) => Ok(true),
            Err(LockError::AlreadyLocked(_)) => {
                debug!("Duplicate schedule skipped for {}", item);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Replaces the host's default pop. Returns the first item of the
    /// queue whose performing lock is free, with its queueing lock
    /// released and its performing lock held; `None` when nothing is
    /// runnable right now. The caller must follow up with
    /// [`confirm_handoff`](Self::confirm_handoff) once the item is
    /// recorded as actively processing.
    #[instrument(skip(self))]
    pub async fn on_dequeue(&self, queue: &str) -> LockResult<Option<QueuedItem>> {
        for item in self.host.everything_in_queue(queue).await? {
            let lock = self.lock_for(&item)?;

            // An identical identity is still executing: not yet runnable,
            // leave it in place
            if lock.perform_locked().await? {
                continue;
            }

            // Another process may win the item between snapshot and remove
            if !self.host.remove_item(queue, &item).await? {
                continue;
            }

            // Buffer first: from here until handoff confirmation a crash
            // must not lose the item
            self.recovering.push(queue, &item).await?;
            lock.ensure_unlock_queueing().await?;

            match lock.try_lock_performing().await {
                Ok(()) => {
                    if lock.variant().locks_on_performing() {
                        self.renewals.start(
                            self.store.clone(),
                            lock.performing_key(),
                            self.config.performing_ttl,
                            self.config.renew_interval,
                        );
                    }
                    return Ok(Some(item));
                }
                Err(LockError::AlreadyLocked(_)) => {
                    // Two processes picked up the same identity; the loser
                    // puts the raw item back and reports nothing runnable
                    debug!("Lost performing-lock race, requeueing {}", item);
                    self.recovering.remove(queue, &item).await?;
                    self.host.push(queue, item).await?;
                    return Ok(None);
                }
                Err(err) => {
                    // Push the raw item back before surfacing the fault; a
                    // failed handoff must never drop the job
                    warn!("Handoff failed for {}: {}; requeueing", item, err);
                    if self.host.push(queue, item.clone()).await.is_ok() {
                        let _ = self.recovering.remove(queue, &item).await;
                    }
                    return Err(err);
                }
            }
        }

        Ok(None)
    }

    /// Called the moment an item is recorded as actively processing;
    /// removes its recovering-buffer entry.
    pub async fn confirm_handoff(&self, queue: &str, item: &QueuedItem) -> LockResult<()> {
        self.recovering.remove(queue, item).await
    }

    /// Called when a job finishes successfully. Releases the performing
    /// lock unconditionally; idempotent.
    #[instrument(skip(self, item), fields(class = %item.class))]
    pub async fn on_finish(&self, item: &QueuedItem) -> LockResult<()> {
        self.release_performing(item).await
    }

    /// Called when a job fails. Releases the performing lock
    /// unconditionally; idempotent.
    #[instrument(skip(self, item), fields(class = %item.class))]
    pub async fn on_failure(&self, item: &QueuedItem) -> LockResult<()> {
        self.release_performing(item).await
    }

    async fn release_performing(&self, item: &QueuedItem) -> LockResult<()> {
        let lock = self.lock_for(item)?;
        self.renewals.stop(&lock.performing_key());
        lock.ensure_unlock_performing().await
    }

    /// Called when the host destroys jobs of a class from a queue.
    /// Releases the queueing locks of every matching item; empty `args`
    /// matches all jobs of the class.
    #[instrument(skip(self, args))]
    pub async fn on_destroy(&self, queue: &str, class: &str, args: &[Value]) -> LockResult<()> {
        for item in self.host.everything_in_queue(queue).await? {
            if item.class != class {
                continue;
            }
            if !args.is_empty() && item.args != args {
                continue;
            }
            self.lock_for(&item)?.ensure_unlock_queueing().await?;
        }
        Ok(())
    }

    /// Called when the host removes an entire queue. Releases the
    /// queueing lock of every distinct item in it.
    #[instrument(skip(self))]
    pub async fn on_remove_queue(&self, queue: &str) -> LockResult<()> {
        let mut seen = HashSet::new();
        for item in self.host.everything_in_queue(queue).await? {
            if seen.insert(self.codec.encode_item(&item)?) {
                self.lock_for(&item)?.ensure_unlock_queueing().await?;
            }
        }
        Ok(())
    }

    /// Called when the host removes a delayed item from the schedule.
    /// Releases its queueing lock.
    #[instrument(skip(self, item), fields(class = %item.class))]
    pub async fn on_remove_delayed(&self, item: &QueuedItem) -> LockResult<()> {
        self.lock_for(item)?.ensure_unlock_queueing().await
    }

    /// Guarantee an item is queued or scheduled: if it is already present
    /// somewhere, do nothing; otherwise re-acquire the queueing lock when
    /// the policy wants one (a lock legitimately still held from the
    /// original enqueue is fine) and push the item onto its queue.
    ///
    /// Used by recovery to resubmit items without ever duplicating a job
    /// that already advanced through the handoff window.
    #[instrument(skip(self, item), fields(class = %item.class, queue = %item.queue))]
    pub async fn ensure_enqueued(&self, item: &QueuedItem) -> LockResult<()> {
        let queued = self.host.everything_in_queue(&item.queue).await?;
        if queued.contains(item) {
            debug!("Item already queued, nothing to recover: {}", item);
            return Ok(());
        }
        match self.host.scheduled_items().await {
            Ok(scheduled) if scheduled.contains(item) => {
                debug!("Item already scheduled, nothing to recover: {}", item);
                return Ok(());
            }
            Ok(_) | Err(LockError::Unsupported(_)) => {}
            Err(err) => return Err(err),
        }

        let lock = self.lock_for(item)?;
        match lock.try_lock_queueing(Duration::ZERO).await {
            Ok(()) | Err(LockError::AlreadyLocked(_)) => {}
            Err(err) => return Err(err),
        }

        self.host.push(&item.queue, item.clone()).await?;
        info!("Recovered item back onto its queue: {}", item);
        Ok(())
    }

    /// Run the recovery sweep over every allowed queue, resubmitting each
    /// overdue item through [`ensure_enqueued`](Self::ensure_enqueued).
    /// Call once per process at startup; safe to run concurrently across
    /// processes. Returns how many items were resubmitted.
    #[instrument(skip(self))]
    pub async fn recover_all(&self) -> LockResult<usize> {
        let recovered = self.recovering.sweep_all().await?;
        let count = recovered.len();
        for (_queue, item) in recovered {
            self.ensure_enqueued(&item).await?;
        }
        if count > 0 {
            info!("Recovery resubmitted {} items", count);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use crate::store::memory::MemoryStore;
    use crate::types::{ClassPolicy, LockVariant};
    use serde_json::json;

    fn adapter_with_default(
        variant: LockVariant,
    ) -> (Arc<MemoryStore>, Arc<MemoryHost>, UniquenessAdapter<MemoryStore, MemoryHost>) {
        let store = Arc::new(MemoryStore::new());
        let host = Arc::new(MemoryHost::new());
        let adapter = UniquenessAdapter::new(
            store.clone(),
            host.clone(),
            PolicyRegistry::new(variant),
        );
        (store, host, adapter)
    }

    fn item(n: i64) -> QueuedItem {
        QueuedItem::new("TestJob", vec![json!(n)], "default")
    }

    #[tokio::test]
    async fn adapter_exposes_its_config() {
        let (_, _, adapter) = adapter_with_default(LockVariant::None);

        assert_eq!(adapter.config().acquire_retries, 3);
        assert_eq!(adapter.config().namespace, "unique_jobs");
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_skipped_silently() {
        let (_, _, adapter) = adapter_with_default(LockVariant::UntilExecuting);

        assert!(adapter
            .before_enqueue(&item(1), EnqueueOrigin::Immediate)
            .await
            .unwrap());
        assert!(!adapter
            .before_enqueue(&item(1), EnqueueOrigin::Immediate)
            .await
            .unwrap());

        // A different identity is unaffected
        assert!(adapter
            .before_enqueue(&item(2), EnqueueOrigin::Immediate)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn scheduler_origin_is_never_blocked() {
        let (_, _, adapter) = adapter_with_default(LockVariant::UntilExecuting);

        assert!(adapter
            .before_schedule(&item(1), Duration::from_secs(60))
            .await
            .unwrap());

        // The scheduler promoting the item must pass despite the held lock
        assert!(adapter
            .before_enqueue(&item(1), EnqueueOrigin::Scheduler)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn none_variant_allows_everything() {
        let (_, _, adapter) = adapter_with_default(LockVariant::None);

        for _ in 0..3 {
            assert!(adapter
                .before_enqueue(&item(1), EnqueueOrigin::Immediate)
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn dequeue_releases_queueing_and_takes_performing() {
        let (_, host, adapter) = adapter_with_default(LockVariant::UntilAndWhileExecuting);

        assert!(adapter
            .before_enqueue(&item(1), EnqueueOrigin::Immediate)
            .await
            .unwrap());
        host.push("default", item(1)).await.unwrap();

        let dequeued = adapter.on_dequeue("default").await.unwrap().unwrap();
        assert_eq!(dequeued, item(1));

        let lock = adapter.lock_for(&item(1)).unwrap();
        assert!(!lock.queueing_locked().await.unwrap());
        assert!(lock.perform_locked().await.unwrap());

        // Queueing is free again, so a fresh copy may be enqueued at once
        assert!(adapter
            .before_enqueue(&item(1), EnqueueOrigin::Immediate)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn dequeue_skips_identity_that_is_executing() {
        let (_, host, adapter) = adapter_with_default(LockVariant::WhileExecuting);

        host.push("default", item(1)).await.unwrap();
        let first = adapter.on_dequeue("default").await.unwrap();
        assert!(first.is_some());

        host.push("default", item(1)).await.unwrap();
        assert!(adapter.on_dequeue("default").await.unwrap().is_none());
        assert_eq!(host.queue_len("default"), 1);

        // Release clears the way
        adapter.on_finish(&item(1)).await.unwrap();
        assert!(adapter.on_dequeue("default").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn finish_and_failure_release_idempotently() {
        let (_, host, adapter) = adapter_with_default(LockVariant::WhileExecuting);

        host.push("default", item(1)).await.unwrap();
        adapter.on_dequeue("default").await.unwrap().unwrap();

        adapter.on_finish(&item(1)).await.unwrap();
        adapter.on_finish(&item(1)).await.unwrap();
        adapter.on_failure(&item(1)).await.unwrap();

        let lock = adapter.lock_for(&item(1)).unwrap();
        assert!(!lock.perform_locked().await.unwrap());
    }

    #[tokio::test]
    async fn destroy_releases_matching_queueing_locks() {
        let (_, host, adapter) = adapter_with_default(LockVariant::UntilExecuting);

        for n in [1, 2] {
            assert!(adapter
                .before_enqueue(&item(n), EnqueueOrigin::Immediate)
                .await
                .unwrap());
            host.push("default", item(n)).await.unwrap();
        }

        adapter
            .on_destroy("default", "TestJob", &[json!(1)])
            .await
            .unwrap();

        assert!(!adapter.lock_for(&item(1)).unwrap().queueing_locked().await.unwrap());
        assert!(adapter.lock_for(&item(2)).unwrap().queueing_locked().await.unwrap());

        // Empty args matches the whole class
        adapter.on_destroy("default", "TestJob", &[]).await.unwrap();
        assert!(!adapter.lock_for(&item(2)).unwrap().queueing_locked().await.unwrap());
    }

    #[tokio::test]
    async fn remove_queue_releases_every_queueing_lock() {
        let (_, host, adapter) = adapter_with_default(LockVariant::UntilExecuting);

        for n in [1, 2] {
            assert!(adapter
                .before_enqueue(&item(n), EnqueueOrigin::Immediate)
                .await
                .unwrap());
            host.push("default", item(n)).await.unwrap();
        }

        adapter.on_remove_queue("default").await.unwrap();

        for n in [1, 2] {
            assert!(!adapter.lock_for(&item(n)).unwrap().queueing_locked().await.unwrap());
        }
    }

    #[tokio::test]
    async fn remove_delayed_releases_the_queueing_lock() {
        let (_, host, adapter) = adapter_with_default(LockVariant::UntilExecuting);

        assert!(adapter
            .before_schedule(&item(1), Duration::from_secs(60))
            .await
            .unwrap());
        host.schedule(item(1));

        adapter.on_remove_delayed(&item(1)).await.unwrap();
        assert!(!adapter.lock_for(&item(1)).unwrap().queueing_locked().await.unwrap());
    }

    #[tokio::test]
    async fn key_override_collapses_identities() {
        let store = Arc::new(MemoryStore::new());
        let host = Arc::new(MemoryHost::new());
        let mut policies = PolicyRegistry::new(LockVariant::None);
        policies.register(
            "SingletonJob",
            ClassPolicy::new(LockVariant::UntilExecuting)
                .with_key_override(Arc::new(|identity| format!("singleton:{}", identity.class))),
        );
        let adapter = UniquenessAdapter::new(store, host, policies);

        let a = QueuedItem::new("SingletonJob", vec![json!(1)], "default");
        let b = QueuedItem::new("SingletonJob", vec![json!(2)], "default");

        assert!(adapter
            .before_enqueue(&a, EnqueueOrigin::Immediate)
            .await
            .unwrap());
        // Different args map onto the same overridden key and are refused
        assert!(!adapter
            .before_enqueue(&b, EnqueueOrigin::Immediate)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn ensure_enqueued_skips_items_already_present() {
        let (_, host, adapter) = adapter_with_default(LockVariant::UntilExecuting);

        host.push("default", item(1)).await.unwrap();
        adapter.ensure_enqueued(&item(1)).await.unwrap();
        assert_eq!(host.queue_len("default"), 1);

        host.schedule(item(2));
        adapter.ensure_enqueued(&item(2)).await.unwrap();
        assert_eq!(host.queue_len("default"), 1);
    }

    #[tokio::test]
    async fn ensure_enqueued_pushes_and_relocks_missing_items() {
        let (_, host, adapter) = adapter_with_default(LockVariant::UntilExecuting);

        adapter.ensure_enqueued(&item(1)).await.unwrap();

        assert_eq!(host.queue_len("default"), 1);
        assert!(adapter.lock_for(&item(1)).unwrap().queueing_locked().await.unwrap());

        // A second call sees the item in place and does not duplicate it
        adapter.ensure_enqueued(&item(1)).await.unwrap();
        assert_eq!(host.queue_len("default"), 1);
    }
}
