//! In-memory store for testing and development.
//!
//! Batches run under one write lock, which gives them the same
//! all-or-nothing view a Redis `MULTI` block has. TTLs are expiry stamps
//! checked on access; an expired key reads as absent. Expiry never touches
//! registry sets - that asymmetry is what makes lock garbage detectable.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use super::{LockStore, StoreOp, StoreReply};
use crate::error::LockResult;

struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, Entry>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, HashMap<String, i64>>,
}

impl MemoryInner {
    /// Drop the key if its TTL has passed, so later operations observe it
    /// as absent
    fn purge_if_expired(&mut self, key: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.strings.get(key) {
            if entry.is_expired(now) {
                self.strings.remove(key);
            }
        }
    }

    /// Shift the counter at `key` by `delta`, keeping its TTL. A missing
    /// or non-integer value counts as zero.
    fn adjust_counter(&mut self, key: String, delta: i64, now: DateTime<Utc>) -> i64 {
        self.purge_if_expired(&key, now);
        let entry = self.strings.entry(key).or_insert(Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        let value = entry.value.parse::<i64>().unwrap_or(0) + delta;
        entry.value = value.to_string();
        value
    }

    fn apply(&mut self, op: StoreOp, now: DateTime<Utc>) -> StoreReply {
        match op {
            StoreOp::GetSet { key, value } => {
                self.purge_if_expired(&key, now);
                let previous = self.strings.insert(
                    key,
                    Entry {
                        value,
                        expires_at: None,
                    },
                );
                match previous {
                    Some(entry) => StoreReply::Value(entry.value),
                    None => StoreReply::Nil,
                }
            }
            StoreOp::Expire { key, ttl } => {
                self.purge_if_expired(&key, now);
                match self.strings.get_mut(&key) {
                    Some(entry) => {
                        // A TTL too large to represent means "no expiry"
                        entry.expires_at = chrono::Duration::from_std(ttl)
                            .ok()
                            .and_then(|ttl| now.checked_add_signed(ttl));
                        StoreReply::Int(1)
                    }
                    None => StoreReply::Int(0),
                }
            }
            StoreOp::Del { key } => {
                let removed = self.strings.remove(&key).is_some();
                StoreReply::Int(removed as i64)
            }
            StoreOp::Incr { key } => StoreReply::Int(self.adjust_counter(key, 1, now)),
            StoreOp::Decr { key } => StoreReply::Int(self.adjust_counter(key, -1, now)),
            StoreOp::SAdd { set, member } => {
                let added = self.sets.entry(set).or_default().insert(member);
                StoreReply::Int(added as i64)
            }
            StoreOp::SRem { set, member } => {
                let removed = self
                    .sets
                    .get_mut(&set)
                    .map(|members| members.remove(&member))
                    .unwrap_or(false);
                StoreReply::Int(removed as i64)
            }
            StoreOp::ZAdd { set, score, member } => {
                let previous = self.zsets.entry(set).or_default().insert(member, score);
                StoreReply::Int(previous.is_none() as i64)
            }
            StoreOp::ZRem { set, member } => {
                let removed = self
                    .zsets
                    .get_mut(&set)
                    .map(|members| members.remove(&member).is_some())
                    .unwrap_or(false);
                StoreReply::Int(removed as i64)
            }
            StoreOp::ZRangeUpTo { set, max } => {
                let mut members: Vec<(i64, String)> = self
                    .zsets
                    .get(&set)
                    .map(|members| {
                        members
                            .iter()
                            .filter(|(_, score)| **score <= max)
                            .map(|(member, score)| (*score, member.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                members.sort();
                StoreReply::Values(members.into_iter().map(|(_, member)| member).collect())
            }
            StoreOp::ZRemRangeUpTo { set, max } => {
                let removed = match self.zsets.get_mut(&set) {
                    Some(members) => {
                        let before = members.len();
                        members.retain(|_, score| *score > max);
                        before - members.len()
                    }
                    None => 0,
                };
                StoreReply::Int(removed as i64)
            }
        }
    }
}

/// In-memory [`LockStore`] implementation
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn batch(&self, ops: Vec<StoreOp>) -> LockResult<Vec<StoreReply>> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        Ok(ops.into_iter().map(|op| inner.apply(op, now)).collect())
    }

    async fn get(&self, key: &str) -> LockResult<Option<String>> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        inner.purge_if_expired(key, now);
        Ok(inner.strings.get(key).map(|entry| entry.value.clone()))
    }

    async fn mget(&self, keys: &[String]) -> LockResult<Vec<Option<String>>> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        Ok(keys
            .iter()
            .map(|key| {
                inner.purge_if_expired(key, now);
                inner.strings.get(key).map(|entry| entry.value.clone())
            })
            .collect())
    }

    async fn exists(&self, key: &str) -> LockResult<bool> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        inner.purge_if_expired(key, now);
        Ok(inner.strings.contains_key(key))
    }

    async fn smembers(&self, set: &str) -> LockResult<Vec<String>> {
        let inner = self.inner.read();
        Ok(inner
            .sets
            .get(set)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn getset_returns_previous_value() {
        let store = MemoryStore::new();

        let replies = store
            .batch(vec![StoreOp::GetSet {
                key: "k".into(),
                value: "first".into(),
            }])
            .await
            .unwrap();
        assert_eq!(replies, vec![StoreReply::Nil]);

        let replies = store
            .batch(vec![StoreOp::GetSet {
                key: "k".into(),
                value: "second".into(),
            }])
            .await
            .unwrap();
        assert_eq!(replies, vec![StoreReply::Value("first".into())]);
    }

    #[tokio::test]
    async fn expired_key_reads_as_absent() {
        let store = MemoryStore::new();
        store
            .batch(vec![
                StoreOp::GetSet {
                    key: "k".into(),
                    value: "v".into(),
                },
                StoreOp::Expire {
                    key: "k".into(),
                    ttl: Duration::from_millis(10),
                },
            ])
            .await
            .unwrap();

        assert!(store.exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expiry_does_not_touch_sets() {
        let store = MemoryStore::new();
        store
            .batch(vec![
                StoreOp::GetSet {
                    key: "k".into(),
                    value: "v".into(),
                },
                StoreOp::Expire {
                    key: "k".into(),
                    ttl: Duration::from_millis(10),
                },
                StoreOp::SAdd {
                    set: "registry".into(),
                    member: "k".into(),
                },
            ])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.smembers("registry").await.unwrap(), vec!["k"]);
    }

    #[tokio::test]
    async fn counters_track_increments_and_decrements() {
        let store = MemoryStore::new();

        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert_eq!(store.incr("c").await.unwrap(), 2);
        assert_eq!(store.decr("c").await.unwrap(), 1);
        assert_eq!(store.decr("missing").await.unwrap(), -1);
        assert_eq!(store.get("c").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn zrange_orders_by_score_then_member() {
        let store = MemoryStore::new();
        store.zadd("z", 3, "c").await.unwrap();
        store.zadd("z", 1, "b").await.unwrap();
        store.zadd("z", 1, "a").await.unwrap();
        store.zadd("z", 9, "late").await.unwrap();

        let members = store.zrange_up_to("z", 5).await.unwrap();
        assert_eq!(members, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn zremrange_removes_what_zrange_read() {
        let store = MemoryStore::new();
        store.zadd("z", 1, "old").await.unwrap();
        store.zadd("z", 9, "new").await.unwrap();

        let replies = store
            .batch(vec![
                StoreOp::ZRangeUpTo {
                    set: "z".into(),
                    max: 5,
                },
                StoreOp::ZRemRangeUpTo {
                    set: "z".into(),
                    max: 5,
                },
            ])
            .await
            .unwrap();

        assert_eq!(
            replies,
            vec![
                StoreReply::Values(vec!["old".into()]),
                StoreReply::Int(1),
            ]
        );
        assert_eq!(store.zrange_up_to("z", i64::MAX).await.unwrap(), vec!["new"]);
    }

    #[tokio::test]
    async fn overwrite_clears_previous_ttl() {
        let store = MemoryStore::new();
        store
            .batch(vec![
                StoreOp::GetSet {
                    key: "k".into(),
                    value: "v1".into(),
                },
                StoreOp::Expire {
                    key: "k".into(),
                    ttl: Duration::from_millis(10),
                },
            ])
            .await
            .unwrap();

        // A fresh GetSet replaces the entry, so the old TTL no longer applies
        store
            .batch(vec![StoreOp::GetSet {
                key: "k".into(),
                value: "v2".into(),
            }])
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.exists("k").await.unwrap());
    }
}
