//! # unique-jobs: job-uniqueness for background queues
//!
//! For a given job identity (class + selected arguments) this crate
//! prevents duplicate queueing and/or duplicate concurrent execution across
//! independent worker processes, coordinating solely through a shared
//! key-value store.
//!
//! ## What it provides
//!
//! - **Lock variants** per job class: `until_executing` holds a queueing
//!   lock while the identity sits in a queue or the delayed schedule;
//!   `while_executing` holds a performing lock while it runs, with a
//!   renewed short TTL so a crashed worker self-heals;
//!   `until_and_while_executing` composes both; `none` opts out.
//! - **Atomic acquire/release**: set-and-read-previous plus TTL plus
//!   registry bookkeeping in one all-or-nothing batch, with bounded retry.
//! - **Crash recovery**: a per-queue recovering buffer records every item
//!   the instant it leaves its queue and restores anything a dead process
//!   left behind.
//! - **Auditing**: reconciles held locks against queue/schedule/worker
//!   state to report unreleased locks and expired registry garbage.
//!
//! ## Quick start
//!
//! ```
//! use unique_jobs::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), unique_jobs::LockError> {
//! let store = Arc::new(MemoryStore::new());
//! let host = Arc::new(MemoryHost::new());
//!
//! let mut policies = PolicyRegistry::new(LockVariant::None);
//! policies.register("MailerJob", ClassPolicy::new(LockVariant::UntilExecuting));
//!
//! let adapter = UniquenessAdapter::new(store, host.clone(), policies);
//!
//! let item = QueuedItem::new("MailerJob", vec![serde_json::json!(42)], "default");
//! if adapter.before_enqueue(&item, EnqueueOrigin::Immediate).await? {
//!     host.push("default", item).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The host queue system calls the [`adapter::UniquenessAdapter`] hooks at
//! enqueue, schedule, dequeue, handoff, finish and destroy time, and
//! supplies implementations of [`store::LockStore`] and
//! [`host::HostQueue`]. In-memory implementations of both ship behind the
//! default `memory` feature.

pub mod adapter;
pub mod audit;
pub mod codec;
pub mod error;
pub mod host;
pub mod lock;
pub mod recovering;
pub mod store;
pub mod types;

pub use adapter::{EnqueueOrigin, UniquenessAdapter, UniquenessConfig};
pub use audit::LockAuditor;
pub use codec::{KeyCodec, LockPurpose};
pub use error::{LockError, LockResult};
pub use host::HostQueue;
pub use lock::renewal::RenewalRegistry;
pub use lock::UniquenessLock;
pub use recovering::RecoveringBuffer;
pub use store::{LockStore, StoreOp, StoreReply};
pub use types::{
    ArgsFilter, ClassPolicy, JobIdentity, KeyOverride, LockVariant, PolicyRegistry, QueuedItem,
    RecoveringItem,
};

#[cfg(feature = "memory")]
pub use host::MemoryHost;
#[cfg(feature = "memory")]
pub use store::memory::MemoryStore;

/// Everything a host integration typically needs
pub mod prelude {
    pub use crate::adapter::{EnqueueOrigin, UniquenessAdapter, UniquenessConfig};
    pub use crate::audit::LockAuditor;
    pub use crate::error::{LockError, LockResult};
    pub use crate::host::HostQueue;
    pub use crate::store::LockStore;
    pub use crate::types::{ClassPolicy, JobIdentity, LockVariant, PolicyRegistry, QueuedItem};

    #[cfg(feature = "memory")]
    pub use crate::host::MemoryHost;
    #[cfg(feature = "memory")]
    pub use crate::store::memory::MemoryStore;
}
