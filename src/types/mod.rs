pub mod identity;
pub mod item;
pub mod policy;

pub use identity::JobIdentity;
pub use item::{QueuedItem, RecoveringItem};
pub use policy::{ArgsFilter, ClassPolicy, KeyOverride, LockVariant, PolicyRegistry};
