//! Bookkeeping for units of work waiting on dependencies.
//!
//! The registry never touches roots or the host directly. It records who is
//! waiting on what, counts how many suspensions hold each root back at each
//! expiration time, and tells the driver which blockers to set or clear.
//! Continuations installed on dependencies only post a [`SchedulerMsg`], so
//! a dependency settling in the middle of a pass cannot re-enter the driver.

use crate::fiber::FiberId;
use crate::host::CancelToken;
use crate::root::RootId;
use futures::channel::mpsc::UnboundedSender;
use nexa_scheduler::{Dependency, ExpirationTime, dependency_key};
use rustc_hash::FxHashMap;
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;

new_key_type! {
    pub struct SuspensionId;
}

/// Messages posted to the driver from outside a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMsg {
    /// The dependency behind a suspension settled.
    Settled(SuspensionId),
    /// A suspension's fallback deadline passed.
    FallbackExpired(SuspensionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryState {
    Pending,
    Suspended { outstanding: usize },
    FallbackShown { outstanding: usize },
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendAction {
    /// Hold the root's commit at this pass's time.
    Block,
    /// Commit with the boundary's fallback in place.
    ShowFallback,
}

/// A `(root, time)` pair whose last blocking suspension went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    pub root: RootId,
    pub time: ExpirationTime,
}

pub type Releases = SmallVec<[Release; 2]>;

pub struct Registration {
    pub id: SuspensionId,
    pub action: SuspendAction,
    /// Set when this suspension is the first to block `(root, time)`.
    pub newly_blocked: Option<ExpirationTime>,
    pub released: Releases,
    /// Delay after which the driver should post `FallbackExpired`.
    pub arm_timer_ms: Option<f64>,
    /// Timer of a record this one replaced.
    pub cancel_timer: Option<CancelToken>,
}

pub struct Settlement {
    pub root: RootId,
    pub fiber: FiberId,
    pub timer: Option<CancelToken>,
    pub released: Releases,
}

pub enum Expiry {
    FallbackShown(Releases),
    MissingBoundary { root: RootId, waited_ms: f64 },
}

struct Suspension {
    root: RootId,
    fiber: FiberId,
    boundary: Option<FiberId>,
    key: usize,
    // Kept so the dependency's address stays unique while tracked.
    _dependency: Dependency,
    registered_at_ms: f64,
    blocked_at: SmallVec<[ExpirationTime; 2]>,
    timer: Option<CancelToken>,
}

struct BoundaryRecord {
    root: RootId,
    state: BoundaryState,
    outstanding: SmallVec<[SuspensionId; 4]>,
}

impl BoundaryRecord {
    fn refresh(&mut self) {
        let outstanding = self.outstanding.len();
        self.state = match (self.state, outstanding) {
            (_, 0) => BoundaryState::Resolved,
            (BoundaryState::FallbackShown { .. }, n) => BoundaryState::FallbackShown { outstanding: n },
            (_, n) => BoundaryState::Suspended { outstanding: n },
        };
    }
}

/// At most one record per fiber: the dependency it last suspended on.
pub struct SuspensionRegistry {
    suspensions: SlotMap<SuspensionId, Suspension>,
    by_fiber: FxHashMap<FiberId, SuspensionId>,
    boundaries: FxHashMap<FiberId, BoundaryRecord>,
    blocks: FxHashMap<(RootId, ExpirationTime), u32>,
    sender: UnboundedSender<SchedulerMsg>,
}

impl SuspensionRegistry {
    pub fn new(sender: UnboundedSender<SchedulerMsg>) -> Self {
        Self {
            suspensions: SlotMap::with_key(),
            by_fiber: FxHashMap::default(),
            boundaries: FxHashMap::default(),
            blocks: FxHashMap::default(),
            sender,
        }
    }

    pub fn len(&self) -> usize {
        self.suspensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suspensions.is_empty()
    }

    pub fn boundary_state(&self, boundary: FiberId) -> BoundaryState {
        self.boundaries
            .get(&boundary)
            .map_or(BoundaryState::Pending, |record| record.state)
    }

    /// Suspensions currently keeping `(root, time)` from committing.
    pub fn block_count(&self, root: RootId, time: ExpirationTime) -> u32 {
        self.blocks.get(&(root, time)).copied().unwrap_or(0)
    }

    /// Records that `fiber` on `root` is waiting on `dependency` during a
    /// pass at `time`.
    ///
    /// The same dependency thrown again by the same fiber reuses the
    /// existing record, so one settlement yields one retry. A different
    /// dependency replaces the record and drops its blocks.
    #[allow(clippy::too_many_arguments)]
    pub fn register_suspension(
        &mut self,
        root: RootId,
        time: ExpirationTime,
        fiber: FiberId,
        boundary: Option<FiberId>,
        dependency: &Dependency,
        fallback_deadline_ms: f64,
        now_ms: f64,
    ) -> Registration {
        let key = dependency_key(dependency);
        let mut released = Releases::new();
        let mut cancel_timer = None;

        let existing = match self.by_fiber.get(&fiber).copied() {
            Some(id) if self.suspensions.get(id).is_some_and(|s| s.key == key && s.root == root) => {
                Some(id)
            }
            Some(stale) => {
                if let Some(replaced) = self.detach(stale) {
                    tracing::debug!(id = ?stale, ?fiber, "suspension replaced by new dependency");
                    released = replaced.released;
                    cancel_timer = replaced.timer;
                }
                None
            }
            None => None,
        };

        let (id, is_new) = match existing {
            Some(id) => (id, false),
            None => (
                self.insert(root, fiber, boundary, key, dependency, now_ms),
                true,
            ),
        };

        let mut registration = Registration {
            id,
            action: SuspendAction::Block,
            newly_blocked: None,
            released,
            arm_timer_ms: None,
            cancel_timer,
        };

        if let Some(boundary) = boundary {
            if matches!(self.boundary_state(boundary), BoundaryState::FallbackShown { .. }) {
                registration.action = SuspendAction::ShowFallback;
                return registration;
            }
            if fallback_deadline_ms <= now_ms {
                let shown = self.show_fallback(boundary);
                registration.released.extend(shown);
                registration.action = SuspendAction::ShowFallback;
                return registration;
            }
        }

        if let Some(suspension) = self.suspensions.get_mut(id) {
            if !suspension.blocked_at.contains(&time) {
                suspension.blocked_at.push(time);
                let count = self.blocks.entry((root, time)).or_insert(0);
                *count += 1;
                if *count == 1 {
                    registration.newly_blocked = Some(time);
                }
            }
        }
        if is_new {
            registration.arm_timer_ms = Some(fallback_deadline_ms - now_ms);
        }
        registration
    }

    fn insert(
        &mut self,
        root: RootId,
        fiber: FiberId,
        boundary: Option<FiberId>,
        key: usize,
        dependency: &Dependency,
        now_ms: f64,
    ) -> SuspensionId {
        let id = self.suspensions.insert(Suspension {
            root,
            fiber,
            boundary,
            key,
            _dependency: dependency.clone(),
            registered_at_ms: now_ms,
            blocked_at: SmallVec::new(),
            timer: None,
        });
        self.by_fiber.insert(fiber, id);

        if let Some(boundary) = boundary {
            let record = self.boundaries.entry(boundary).or_insert(BoundaryRecord {
                root,
                state: BoundaryState::Pending,
                outstanding: SmallVec::new(),
            });
            record.outstanding.push(id);
            record.refresh();
        }

        let sender = self.sender.clone();
        dependency.then(Box::new(move || {
            // The receiver is gone once the scheduler is dropped.
            let _ = sender.unbounded_send(SchedulerMsg::Settled(id));
        }));

        tracing::debug!(?id, ?fiber, ?boundary, "suspension registered");
        id
    }

    pub fn set_timer(&mut self, id: SuspensionId, token: CancelToken) {
        if let Some(suspension) = self.suspensions.get_mut(id) {
            suspension.timer = Some(token);
        }
    }

    /// Handles a settled dependency. `None` means the suspension was already
    /// settled or released.
    pub fn settle(&mut self, id: SuspensionId) -> Option<Settlement> {
        let settlement = self.detach(id)?;
        tracing::debug!(?id, fiber = ?settlement.fiber, "suspension settled");
        Some(settlement)
    }

    /// Drops the record of a fiber that rendered without suspending. Its
    /// continuation becomes a no-op.
    pub fn release_fiber(&mut self, fiber: FiberId) -> Option<Settlement> {
        let id = self.by_fiber.get(&fiber).copied()?;
        let settlement = self.detach(id)?;
        tracing::debug!(?id, ?fiber, "fiber stopped suspending");
        Some(settlement)
    }

    fn detach(&mut self, id: SuspensionId) -> Option<Settlement> {
        let suspension = self.suspensions.remove(id)?;
        if self.by_fiber.get(&suspension.fiber) == Some(&id) {
            self.by_fiber.remove(&suspension.fiber);
        }

        if let Some(boundary) = suspension.boundary {
            if let Some(record) = self.boundaries.get_mut(&boundary) {
                record.outstanding.retain(|other| *other != id);
                record.refresh();
            }
        }

        let released = self.release_blocks(suspension.root, &suspension.blocked_at);
        Some(Settlement {
            root: suspension.root,
            fiber: suspension.fiber,
            timer: suspension.timer,
            released,
        })
    }

    /// Handles a fallback deadline. `None` means the suspension already
    /// settled.
    pub fn expire(&mut self, id: SuspensionId, now_ms: f64) -> Option<Expiry> {
        let suspension = self.suspensions.get_mut(id)?;
        suspension.timer = None;
        let (root, boundary, registered_at_ms) =
            (suspension.root, suspension.boundary, suspension.registered_at_ms);

        match boundary {
            Some(boundary) => Some(Expiry::FallbackShown(self.show_fallback(boundary))),
            None => Some(Expiry::MissingBoundary {
                root,
                waited_ms: now_ms - registered_at_ms,
            }),
        }
    }

    /// Moves a boundary to `FallbackShown` and lifts every block its
    /// outstanding suspensions hold.
    fn show_fallback(&mut self, boundary: FiberId) -> Releases {
        let Some(record) = self.boundaries.get_mut(&boundary) else {
            return Releases::new();
        };
        if let BoundaryState::Suspended { outstanding } = record.state {
            record.state = BoundaryState::FallbackShown { outstanding };
            tracing::debug!(?boundary, outstanding, "showing fallback");
        }

        let root = record.root;
        let ids = record.outstanding.clone();
        let mut released = Releases::new();
        for id in ids {
            let blocked_at = match self.suspensions.get_mut(id) {
                Some(suspension) => std::mem::take(&mut suspension.blocked_at),
                None => continue,
            };
            released.extend(self.release_blocks(root, &blocked_at));
        }
        released
    }

    fn release_blocks(&mut self, root: RootId, times: &[ExpirationTime]) -> Releases {
        let mut released = Releases::new();
        for &time in times {
            if let Some(count) = self.blocks.get_mut(&(root, time)) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.blocks.remove(&(root, time));
                    released.push(Release { root, time });
                }
            }
        }
        released
    }

    /// Forgets everything recorded for `root`. Continuations still attached
    /// to its dependencies become no-ops. Returns timers to cancel.
    pub fn release_root(&mut self, root: RootId) -> Vec<CancelToken> {
        let ids: Vec<_> = self
            .suspensions
            .iter()
            .filter(|(_, s)| s.root == root)
            .map(|(id, _)| id)
            .collect();

        let mut timers = Vec::new();
        for id in ids {
            if let Some(suspension) = self.suspensions.remove(id) {
                timers.extend(suspension.timer);
                self.by_fiber.remove(&suspension.fiber);
            }
        }
        self.boundaries.retain(|_, record| record.root != root);
        self.blocks.retain(|(blocked_root, _), _| *blocked_root != root);
        timers
    }
}
