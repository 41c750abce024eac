//! Root scheduling for incremental tree rendering.
//!
//! Trees are described with [`Element`], mounted into a [`FiberRoot`] and
//! rendered by a [`WorkScheduler`] one fiber at a time. Components may
//! suspend on a [`nexa_scheduler::Dependency`]; the nearest boundary shows
//! its fallback or holds the commit until the dependency settles.

pub mod config;
pub mod error;
pub mod fiber;
pub mod host;
pub mod root;
pub mod scheduler;
pub mod suspense;
pub(crate) mod work;

pub use config::{ConfigError, SchedulerConfig};
pub use error::SchedulerError;
pub use fiber::{Element, FiberArena, FiberId, RenderFn, Update};
pub use host::{CancelToken, Host, HostNode};
pub use root::{CompletionCallback, FiberRoot, HostContext, RootId, is_root_blocked};
pub use scheduler::{Profiling, WorkScheduler, WorkStatus};
pub use suspense::{BoundaryState, SchedulerMsg, SuspensionId};

pub use nexa_scheduler::{Deferred, Dependency, ExpirationTime, Priority, Step};
