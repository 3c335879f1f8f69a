//! Key codec: stable identity encoding and the layout of every persisted
//! store key.
//!
//! All keys are derived here so the layout lives in exactly one place:
//!
//! - `queueing:{ns}:{identity}` / `performing:{ns}:{identity}` - lock records
//! - `{ns}:queueing:all_locks` / `{ns}:performing:all_locks` - lock registries
//! - `recovering:queue:{queue}` - per-queue recovering buffer (ordered set)
//! - `recovering:allowed:queues` - queues opted into recovery

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::LockResult;
use crate::types::{JobIdentity, QueuedItem, RecoveringItem};

/// Key for the set of queue names opted into recovery
pub const ALLOWED_QUEUES_KEY: &str = "recovering:allowed:queues";

const RECOVERING_QUEUE_PREFIX: &str = "recovering:queue:";

/// The two independent lock concerns. Keys for different purposes never
/// collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPurpose {
    /// Held while a job identity occupies the queue or delayed schedule
    Queueing,

    /// Held while a job identity is actively executing
    Performing,
}

impl LockPurpose {
    /// Get the purpose name as used in key layouts
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queueing => "queueing",
            Self::Performing => "performing",
        }
    }
}

impl fmt::Display for LockPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derives stable identity strings and store keys under one namespace
#[derive(Debug, Clone)]
pub struct KeyCodec {
    namespace: String,
}

impl KeyCodec {
    /// Create a codec for the given namespace
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The namespace this codec derives keys under
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Stable identity string: JSON of the canonical (class, args) pair.
    /// Deterministic because struct field order is fixed and map keys are
    /// sorted by serde_json.
    pub fn encode_identity(&self, identity: &JobIdentity) -> LockResult<String> {
        Ok(serde_json::to_string(identity)?)
    }

    /// Lock key for an already-encoded identity
    pub fn lock_key(&self, purpose: LockPurpose, encoded_identity: &str) -> String {
        format!("{}:{}:{}", purpose.as_str(), self.namespace, encoded_identity)
    }

    /// Registry set holding every acquired-and-not-released lock key of a
    /// purpose
    pub fn registry_key(&self, purpose: LockPurpose) -> String {
        format!("{}:{}:all_locks", self.namespace, purpose.as_str())
    }

    /// Recovering-buffer ordered set for a queue
    pub fn recovering_queue_key(&self, queue: &str) -> String {
        format!("{RECOVERING_QUEUE_PREFIX}{queue}")
    }

    /// Encode a lock-record payload
    pub fn encode_item(&self, item: &QueuedItem) -> LockResult<String> {
        Ok(serde_json::to_string(item)?)
    }

    /// Decode a lock-record payload
    pub fn decode_item(&self, encoded: &str) -> LockResult<QueuedItem> {
        Ok(serde_json::from_str(encoded)?)
    }

    /// Encode a recovering-buffer member
    pub fn encode_recovering(&self, entry: &RecoveringItem) -> LockResult<String> {
        Ok(serde_json::to_string(entry)?)
    }

    /// Decode a recovering-buffer member
    pub fn decode_recovering(&self, encoded: &str) -> LockResult<RecoveringItem> {
        Ok(serde_json::from_str(encoded)?)
    }
}
