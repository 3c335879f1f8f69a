use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Canonical (class, argument-subset) pair identifying "the same job" for
/// locking purposes.
///
/// Two jobs are the same iff their identities are structurally equal. `args`
/// holds the canonical argument list: by default every argument, or the
/// subset selected by the class's argument filter (applied by the policy
/// layer before the identity is built).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobIdentity {
    /// Job class name
    pub class: String,

    /// Canonical (possibly filtered) arguments
    pub args: Vec<Value>,
}

impl JobIdentity {
    /// Create an identity from a class name and canonical arguments
    pub fn new(class: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class: class.into(),
            args,
        }
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} args)", self.class, self.args.len())
    }
}
