use thiserror::Error;

/// Result type for locking operations
pub type LockResult<T> = Result<T, LockError>;

/// Errors raised by the uniqueness layer
#[derive(Error, Debug, Clone)]
pub enum LockError {
    /// A concurrent acquirer won the race for this key. Recoverable:
    /// callers skip the enqueue or requeue the item, they never abort a job.
    #[error("Lock already held: {0}")]
    AlreadyLocked(String),

    /// An atomic multi-operation batch did not complete in full, even after
    /// bounded retries. The lock is treated as not confirmed, never as a
    /// lost job.
    #[error("Atomic batch did not complete after {attempts} attempts")]
    BatchFailed { attempts: u32 },

    /// The store or host does not support a required operation
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// Identity or item encoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Underlying store failure
    #[error("Store error: {0}")]
    Store(String),
}

impl LockError {
    /// Check whether this error is a lost acquire race
    pub fn is_lock_race(&self) -> bool {
        matches!(self, Self::AlreadyLocked(_))
    }
}

impl From<serde_json::Error> for LockError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
