use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{JobIdentity, QueuedItem};

/// Projection selecting the subset of arguments that defines uniqueness
pub type ArgsFilter = Arc<dyn Fn(&[Value]) -> Vec<Value> + Send + Sync>;

/// Per-class override of the default identity encoding
pub type KeyOverride = Arc<dyn Fn(&JobIdentity) -> String + Send + Sync>;

/// Lock variant controlling when a lock is acquired and released for a job
/// class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockVariant {
    /// No uniqueness: every lock operation is a no-op
    None,

    /// Queueing lock held while the identity occupies the queue or the
    /// delayed schedule; released the instant a worker dequeues the job
    UntilExecuting,

    /// Performing lock held while the identity is actively executing;
    /// identical items wait in the queue until it clears
    WhileExecuting,

    /// Both of the above, independently: the queueing lock is released
    /// exactly when the performing lock is acquired
    UntilAndWhileExecuting,
}

impl LockVariant {
    /// Whether this variant acquires a queueing lock
    pub fn locks_on_queueing(&self) -> bool {
        matches!(self, Self::UntilExecuting | Self::UntilAndWhileExecuting)
    }

    /// Whether this variant acquires a performing lock
    pub fn locks_on_performing(&self) -> bool {
        matches!(self, Self::WhileExecuting | Self::UntilAndWhileExecuting)
    }

    /// Get the variant name as a string
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::UntilExecuting => "until_executing",
            Self::WhileExecuting => "while_executing",
            Self::UntilAndWhileExecuting => "until_and_while_executing",
        }
    }
}

/// Uniqueness policy for a single job class
#[derive(Clone)]
pub struct ClassPolicy {
    /// Lock variant for the class
    pub variant: LockVariant,

    /// Optional projection selecting the arguments that define uniqueness.
    /// Defaults to all arguments.
    pub args_filter: Option<ArgsFilter>,

    /// Optional replacement for the default identity encoding
    pub key_override: Option<KeyOverride>,
}

impl ClassPolicy {
    /// Create a policy with the given variant and default identity rules
    pub fn new(variant: LockVariant) -> Self {
        Self {
            variant,
            args_filter: None,
            key_override: None,
        }
    }

    /// Set the argument filter
    pub fn with_args_filter(mut self, filter: ArgsFilter) -> Self {
        self.args_filter = Some(filter);
        self
    }

    /// Set the identity-encoding override
    pub fn with_key_override(mut self, key: KeyOverride) -> Self {
        self.key_override = Some(key);
        self
    }
}

impl fmt::Debug for ClassPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassPolicy")
            .field("variant", &self.variant)
            .field("args_filter", &self.args_filter.as_ref().map(|_| "<fn>"))
            .field("key_override", &self.key_override.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Registry of per-class policies plus the process-wide default variant.
///
/// The default is injected at construction rather than read from mutable
/// global state, so two adapters in one process can disagree about it.
pub struct PolicyRegistry {
    default_variant: LockVariant,
    classes: HashMap<String, ClassPolicy>,
}

impl PolicyRegistry {
    /// Create a registry with the given default variant
    pub fn new(default_variant: LockVariant) -> Self {
        Self {
            default_variant,
            classes: HashMap::new(),
        }
    }

    /// Register a policy for a job class
    pub fn register(&mut self, class: impl Into<String>, policy: ClassPolicy) {
        self.classes.insert(class.into(), policy);
    }

    /// Policy for a class, falling back to the default variant
    pub fn policy_for(&self, class: &str) -> ClassPolicy {
        self.classes
            .get(class)
            .cloned()
            .unwrap_or_else(|| ClassPolicy::new(self.default_variant))
    }

    /// Lock variant for a class
    pub fn variant_for(&self, class: &str) -> LockVariant {
        self.policy_for(class).variant
    }

    /// Canonical identity of an item, with the class's argument filter
    /// applied when one is registered
    pub fn identity_for(&self, item: &QueuedItem) -> JobIdentity {
        let policy = self.policy_for(&item.class);
        let args = match &policy.args_filter {
            Some(filter) => filter(&item.args),
            None => item.args.clone(),
        };
        JobIdentity::new(item.class.clone(), args)
    }
}
