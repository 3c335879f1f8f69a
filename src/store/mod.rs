//! Shared key-value store abstraction.
//!
//! The store is the only coordination medium between worker processes, so
//! everything that must be all-or-nothing goes through [`LockStore::batch`]:
//! one atomic multi-operation round trip, mirroring a Redis `MULTI` block.
//! Single-operation conveniences are provided on top of `batch` so an
//! implementation only supplies the atomic core plus the read primitives.

#[cfg(feature = "memory")]
pub mod memory;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{LockError, LockResult};

/// One operation inside an atomic batch
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Set `key` to `value`, returning the previous value
    GetSet { key: String, value: String },

    /// Set the TTL of `key`
    Expire { key: String, ttl: Duration },

    /// Delete `key`
    Del { key: String },

    /// Increment the integer at `key`, treating a missing key as zero
    Incr { key: String },

    /// Decrement the integer at `key`, treating a missing key as zero
    Decr { key: String },

    /// Add `member` to the set `set`
    SAdd { set: String, member: String },

    /// Remove `member` from the set `set`
    SRem { set: String, member: String },

    /// Add `member` with `score` to the ordered set `set`
    ZAdd {
        set: String,
        score: i64,
        member: String,
    },

    /// Remove `member` from the ordered set `set`
    ZRem { set: String, member: String },

    /// Read members of the ordered set `set` with score <= `max`, ordered
    /// by (score, member)
    ZRangeUpTo { set: String, max: i64 },

    /// Remove members of the ordered set `set` with score <= `max`
    ZRemRangeUpTo { set: String, max: i64 },
}

/// Reply to one batched operation
#[derive(Debug, Clone, PartialEq)]
pub enum StoreReply {
    /// No previous value
    Nil,

    /// A previous or read value
    Value(String),

    /// An operation count or flag
    Int(i64),

    /// Members read from a set
    Values(Vec<String>),
}

/// Atomic primitives over the shared store.
///
/// `batch` must apply every operation or none: a half-applied batch is a
/// store bug, not a condition this crate tolerates. Reads (`get`, `mget`,
/// `exists`, `smembers`) need no atomicity beyond single-key consistency.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Apply the operations as one all-or-nothing batch, returning one
    /// reply per operation in order. Implementations return
    /// [`LockError::BatchFailed`] when the store aborted a multi-operation
    /// transaction; callers retry a bounded number of times.
    async fn batch(&self, ops: Vec<StoreOp>) -> LockResult<Vec<StoreReply>>;

    /// Read the value at `key`, if present and not expired
    async fn get(&self, key: &str) -> LockResult<Option<String>>;

    /// Read several keys at once, `None` per missing or expired key
    async fn mget(&self, keys: &[String]) -> LockResult<Vec<Option<String>>>;

    /// Whether `key` currently exists
    async fn exists(&self, key: &str) -> LockResult<bool>;

    /// Members of the set `set`
    async fn smembers(&self, set: &str) -> LockResult<Vec<String>>;

    /// Set the TTL of a key, returning whether the key existed
    async fn expire(&self, key: &str, ttl: Duration) -> LockResult<bool> {
        let replies = self
            .batch(vec![StoreOp::Expire {
                key: key.to_string(),
                ttl,
            }])
            .await?;
        Ok(matches!(replies.first(), Some(StoreReply::Int(n)) if *n > 0))
    }

    /// Delete a key
    async fn del(&self, key: &str) -> LockResult<()> {
        self.batch(vec![StoreOp::Del {
            key: key.to_string(),
        }])
        .await?;
        Ok(())
    }

    /// Increment the counter at a key, returning the new value. Counter
    /// values double as lock sentinels for stores carrying legacy state.
    async fn incr(&self, key: &str) -> LockResult<i64> {
        let replies = self
            .batch(vec![StoreOp::Incr {
                key: key.to_string(),
            }])
            .await?;
        match replies.into_iter().next() {
            Some(StoreReply::Int(value)) => Ok(value),
            other => Err(LockError::Store(format!(
                "unexpected reply to Incr: {other:?}"
            ))),
        }
    }

    /// Decrement the counter at a key, returning the new value
    async fn decr(&self, key: &str) -> LockResult<i64> {
        let replies = self
            .batch(vec![StoreOp::Decr {
                key: key.to_string(),
            }])
            .await?;
        match replies.into_iter().next() {
            Some(StoreReply::Int(value)) => Ok(value),
            other => Err(LockError::Store(format!(
                "unexpected reply to Decr: {other:?}"
            ))),
        }
    }

    /// Add a member to a set
    async fn sadd(&self, set: &str, member: &str) -> LockResult<()> {
        self.batch(vec![StoreOp::SAdd {
            set: set.to_string(),
            member: member.to_string(),
        }])
        .await?;
        Ok(())
    }

    /// Remove a member from a set
    async fn srem(&self, set: &str, member: &str) -> LockResult<()> {
        self.batch(vec![StoreOp::SRem {
            set: set.to_string(),
            member: member.to_string(),
        }])
        .await?;
        Ok(())
    }

    /// Add a scored member to an ordered set
    async fn zadd(&self, set: &str, score: i64, member: &str) -> LockResult<()> {
        self.batch(vec![StoreOp::ZAdd {
            set: set.to_string(),
            score,
            member: member.to_string(),
        }])
        .await?;
        Ok(())
    }

    /// Remove a member from an ordered set
    async fn zrem(&self, set: &str, member: &str) -> LockResult<()> {
        self.batch(vec![StoreOp::ZRem {
            set: set.to_string(),
            member: member.to_string(),
        }])
        .await?;
        Ok(())
    }

    /// Members of an ordered set with score <= `max`
    async fn zrange_up_to(&self, set: &str, max: i64) -> LockResult<Vec<String>> {
        let replies = self
            .batch(vec![StoreOp::ZRangeUpTo {
                set: set.to_string(),
                max,
            }])
            .await?;
        match replies.into_iter().next() {
            Some(StoreReply::Values(members)) => Ok(members),
            other => Err(LockError::Store(format!(
                "unexpected reply to ZRangeUpTo: {other:?}"
            ))),
        }
    }
}
