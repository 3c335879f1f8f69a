use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::JobIdentity;

/// Raw queue payload at the host boundary: the job class, its full argument
/// list and the queue it belongs to. This is also the value stored inside a
/// lock record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedItem {
    /// Job class name
    pub class: String,

    /// Full argument list as submitted
    pub args: Vec<Value>,

    /// Queue the item belongs to
    pub queue: String,
}

impl QueuedItem {
    /// Create a new queued item
    pub fn new(class: impl Into<String>, args: Vec<Value>, queue: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            args,
            queue: queue.into(),
        }
    }

    /// Unfiltered identity of this item. The policy layer applies the
    /// class's argument filter on top of this when one is registered.
    pub fn identity(&self) -> JobIdentity {
        JobIdentity::new(self.class.clone(), self.args.clone())
    }
}

impl fmt::Display for QueuedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.class, self.queue)
    }
}

/// Entry of the per-queue recovering buffer: the raw item tagged with a
/// fresh token at the moment it left the main queue.
///
/// Created exactly once on dequeue, destroyed exactly once - on handoff
/// confirmation or by a recovery sweep. Removal looks entries up by item
/// content, not by token, so "is this job still recovering" checks stay
/// correct under concurrent access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveringItem {
    /// The raw item as it was popped from the queue
    #[serde(flatten)]
    pub item: QueuedItem,

    /// Unique token assigned when the item entered the buffer
    pub token: Uuid,
}

impl RecoveringItem {
    /// Tag an item with a fresh token
    pub fn tag(item: QueuedItem) -> Self {
        Self {
            item,
            token: Uuid::new_v4(),
        }
    }
}
