use crate::root::RootId;
use crate::suspense::SuspensionId;
use nexa_scheduler::ExpirationTime;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    /// The root has an unresolved blocker at or before `time`. Recoverable.
    #[error("commit at {time} on root {root:?} is blocked")]
    BlockedCommit { root: RootId, time: ExpirationTime },

    /// A settled dependency no longer maps to a live subtree.
    #[error("suspension {0:?} is no longer registered")]
    StaleSuspension(SuspensionId),

    #[error("work did not settle after {passes} passes")]
    SchedulingOverflow { passes: usize },

    #[error("root {0:?} has no finished work to commit")]
    NothingToCommit(RootId),

    #[error("root {0:?} is not mounted")]
    UnknownRoot(RootId),

    #[error("root {root:?} suspended outside any fallback boundary for {waited_ms}ms")]
    MissingFallbackBoundary { root: RootId, waited_ms: f64 },
}

impl SchedulerError {
    /// Whether the host should treat this as a failure of the scheduler itself.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::SchedulingOverflow { .. }
                | SchedulerError::NothingToCommit(_)
                | SchedulerError::UnknownRoot(_)
        )
    }
}
