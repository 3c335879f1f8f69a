//! Lock state machines and the atomic acquire/release protocol.
//!
//! One [`UniquenessLock`] covers both concerns of one job identity: the
//! queueing lock (identity occupies the queue or schedule) and the
//! performing lock (identity is executing). Which concerns are live is
//! decided by the class's [`LockVariant`]; operations on a concern the
//! variant does not lock are documented no-ops.
//!
//! Acquire is one atomic batch: set-and-read-previous, TTL, registry add.
//! A non-empty previous value means another holder owns the key. Release is
//! an atomic delete plus registry remove. Registry entries are only ever
//! removed by explicit release - a key that expired underneath its registry
//! entry is detectable garbage, audited by [`crate::audit::LockAuditor`].

pub mod renewal;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapter::UniquenessConfig;
use crate::codec::{KeyCodec, LockPurpose};
use crate::error::{LockError, LockResult};
use crate::store::{LockStore, StoreOp, StoreReply};
use crate::types::{LockVariant, QueuedItem};

/// Lock handle for one job identity
pub struct UniquenessLock<S: LockStore + ?Sized> {
    store: Arc<S>,
    codec: KeyCodec,
    config: Arc<UniquenessConfig>,
    variant: LockVariant,
    item: QueuedItem,
    encoded_identity: String,
}

impl<S: LockStore + ?Sized> UniquenessLock<S> {
    /// Create a lock handle. `encoded_identity` is the canonical identity
    /// string produced by the key codec (or a class's key override).
    pub fn new(
        store: Arc<S>,
        codec: KeyCodec,
        config: Arc<UniquenessConfig>,
        variant: LockVariant,
        item: QueuedItem,
        encoded_identity: String,
    ) -> Self {
        Self {
            store,
            codec,
            config,
            variant,
            item,
            encoded_identity,
        }
    }

    /// The variant driving this lock's state machines
    pub fn variant(&self) -> LockVariant {
        self.variant
    }

    /// Store key of the queueing lock
    pub fn queueing_key(&self) -> String {
        self.codec
            .lock_key(LockPurpose::Queueing, &self.encoded_identity)
    }

    /// Store key of the performing lock
    pub fn performing_key(&self) -> String {
        self.codec
            .lock_key(LockPurpose::Performing, &self.encoded_identity)
    }

    fn key_for(&self, purpose: LockPurpose) -> String {
        self.codec.lock_key(purpose, &self.encoded_identity)
    }

    /// Whether the queueing lock is currently held for this identity.
    /// Always false for variants that do not lock on queueing.
    pub async fn queueing_locked(&self) -> LockResult<bool> {
        if !self.variant.locks_on_queueing() {
            return Ok(false);
        }
        self.store.exists(&self.queueing_key()).await
    }

    /// Whether the performing lock is currently held for this identity.
    /// Always false for variants that do not lock on performing.
    pub async fn perform_locked(&self) -> LockResult<bool> {
        if !self.variant.locks_on_performing() {
            return Ok(false);
        }
        self.store.exists(&self.performing_key()).await
    }

    /// Acquire the queueing lock. `ttl_hint` is the delay until the job is
    /// due to run (zero for immediate enqueues); the lock expires after
    /// `ttl_hint + queueing_ttl_buffer`, so an abandoned lock self-heals
    /// even for jobs parked in the delayed schedule.
    ///
    /// No-op for variants without a queueing lock. Returns
    /// [`LockError::AlreadyLocked`] when a concurrent acquirer won.
    pub async fn try_lock_queueing(&self, ttl_hint: Duration) -> LockResult<()> {
        if !self.variant.locks_on_queueing() {
            return Ok(());
        }
        let ttl = ttl_hint + self.config.queueing_ttl_buffer;
        self.set_lock(LockPurpose::Queueing, ttl).await
    }

    /// Acquire the performing lock with the configured short TTL. The
    /// caller is responsible for starting renewal while execution runs.
    ///
    /// No-op for variants without a performing lock. Returns
    /// [`LockError::AlreadyLocked`] when a concurrent acquirer won.
    pub async fn try_lock_performing(&self) -> LockResult<()> {
        if !self.variant.locks_on_performing() {
            return Ok(());
        }
        self.set_lock(LockPurpose::Performing, self.config.performing_ttl)
            .await
    }

    /// Release the queueing lock if held. Idempotent: releasing an
    /// unlocked identity does nothing and touches no registry entry.
    pub async fn ensure_unlock_queueing(&self) -> LockResult<()> {
        if !self.queueing_locked().await? {
            return Ok(());
        }
        self.remove_lock(LockPurpose::Queueing).await
    }

    /// Release the performing lock if held. Idempotent.
    pub async fn ensure_unlock_performing(&self) -> LockResult<()> {
        if !self.perform_locked().await? {
            return Ok(());
        }
        self.remove_lock(LockPurpose::Performing).await
    }

    /// Atomic acquire: set-and-read-previous + TTL + registry add, in one
    /// batch. The batch is retried a bounded number of times; after that
    /// the lock is treated as not confirmed and the operation proceeds, so
    /// a flaky store degrades uniqueness rather than losing jobs.
    async fn set_lock(&self, purpose: LockPurpose, ttl: Duration) -> LockResult<()> {
        let key = self.key_for(purpose);
        let payload = self.codec.encode_item(&self.item)?;
        let ops = vec![
            StoreOp::GetSet {
                key: key.clone(),
                value: payload,
            },
            StoreOp::Expire {
                key: key.clone(),
                ttl,
            },
            StoreOp::SAdd {
                set: self.codec.registry_key(purpose),
                member: key.clone(),
            },
        ];

        for attempt in 1..=self.config.acquire_retries {
            match self.store.batch(ops.clone()).await {
                Ok(replies) => {
                    if matches!(replies.first(), Some(StoreReply::Value(_))) {
                        return Err(LockError::AlreadyLocked(key));
                    }
                    info!("Set {} lock for key: {}", purpose, key);
                    return Ok(());
                }
                Err(err) => {
                    debug!(
                        "Acquire batch attempt {}/{} failed for key {}: {}",
                        attempt, self.config.acquire_retries, key, err
                    );
                }
            }
        }

        warn!(
            "Acquire batch exhausted {} attempts for key {}; treating lock as not confirmed",
            self.config.acquire_retries, key
        );
        Ok(())
    }

    /// Atomic release: delete + registry remove, in one batch, with the
    /// same bounded retry as acquire.
    async fn remove_lock(&self, purpose: LockPurpose) -> LockResult<()> {
        let key = self.key_for(purpose);
        let ops = vec![
            StoreOp::Del { key: key.clone() },
            StoreOp::SRem {
                set: self.codec.registry_key(purpose),
                member: key.clone(),
            },
        ];

        for attempt in 1..=self.config.acquire_retries {
            match self.store.batch(ops.clone()).await {
                Ok(_) => {
                    info!("Removed {} lock for key: {}", purpose, key);
                    return Ok(());
                }
                Err(err) => {
                    debug!(
                        "Release batch attempt {}/{} failed for key {}: {}",
                        attempt, self.config.acquire_retries, key, err
                    );
                }
            }
        }

        warn!(
            "Release batch exhausted {} attempts for key {}; key will self-heal via TTL",
            self.config.acquire_retries, key
        );
        Ok(())
    }
}
