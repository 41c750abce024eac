//! Priority and suspension primitives shared by the Nexa work scheduler.
//!
//! Nothing in this crate reads a clock or owns a tree. Hosts feed
//! timestamps into an [`ExpirationClock`], producers push work into an
//! [`UpdateQueue`], and units of work report [`Step::Suspended`] with a
//! [`Thenable`] when they have to wait.

pub mod expiration;
pub mod queue;
pub mod thenable;

pub use expiration::{ExpirationClock, ExpirationConfig, ExpirationTime, Priority};
pub use queue::{DrainUpTo, MergePolicy, UpdateQueue, min_time_of};
pub use thenable::{Deferred, DeferredState, Dependency, Step, Thenable, dependency_key};
