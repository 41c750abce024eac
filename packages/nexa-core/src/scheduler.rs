//! The work loop.
//!
//! [`WorkScheduler`] owns every mounted root and the fiber arena they share.
//! Each call to [`WorkScheduler::perform_work`] is one driver turn: it first
//! drains messages posted by settled dependencies and fallback timers, then
//! picks the most urgent scheduled root and advances its pass one fiber at a
//! time until the pass commits, the frame budget runs out, or nothing is
//! left to do.

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::fiber::{Element, Fiber, FiberArena, FiberId, FiberKind, Update};
use crate::host::Host;
use crate::root::{CompletionCallback, FiberRoot, FinishedWork, HostContext, RootId};
use crate::suspense::{Expiry, Release, SchedulerMsg, SuspensionId, SuspensionRegistry};
use crate::work::{SuspendRequest, UnitOutcome, WorkInProgress};
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use nexa_devtools::{DevToolsSnapshot, RootSnapshot, SchedulerMetrics, devtools};
use nexa_scheduler::{ExpirationClock, ExpirationTime, Priority};
use slotmap::{Key, SlotMap};

#[derive(Default, Debug, Clone)]
pub struct Profiling {
    pub passes: u64,
    pub units: u64,
    pub commits: u64,
    pub blocked_commits: u64,
    pub yields: u64,
    pub interruptions: u64,
    pub suspensions: u64,
}

/// What a driver turn left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// No root is scheduled.
    Idle,
    /// Every scheduled root is held back by a blocker or waiting on a timer.
    Waiting,
    /// The frame budget ran out with work remaining.
    Yielded,
}

enum RootProgress {
    Committed,
    Blocked,
    Yielded,
}

pub struct WorkScheduler<H: Host> {
    host: H,
    config: SchedulerConfig,
    clock: ExpirationClock,
    fibers: FiberArena,
    roots: SlotMap<RootId, FiberRoot<H::Container>>,
    /// Scheduled roots in round-robin order.
    schedule: Vec<RootId>,
    cursor: usize,
    registry: SuspensionRegistry,
    sender: UnboundedSender<SchedulerMsg>,
    receiver: UnboundedReceiver<SchedulerMsg>,
    pub profiling: Profiling,
}

impl<H: Host> WorkScheduler<H> {
    pub fn new(host: H) -> Self {
        Self::with_config(host, SchedulerConfig::default())
    }

    pub fn with_config(host: H, config: SchedulerConfig) -> Self {
        let clock = ExpirationClock::new(host.now(), config.expiration);
        let (sender, receiver) = unbounded();
        Self {
            host,
            clock,
            config,
            fibers: FiberArena::new(),
            roots: SlotMap::with_key(),
            schedule: Vec::new(),
            cursor: 0,
            registry: SuspensionRegistry::new(sender.clone()),
            sender,
            receiver,
            profiling: Profiling::default(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn fibers(&self) -> &FiberArena {
        &self.fibers
    }

    pub fn root(&self, id: RootId) -> Option<&FiberRoot<H::Container>> {
        self.roots.get(id)
    }

    pub fn current_time(&self) -> ExpirationTime {
        self.clock.now(self.host.now())
    }

    pub fn request_expiration(&self, priority: Priority) -> ExpirationTime {
        self.clock.expiration_for(priority, self.host.now())
    }

    pub fn is_root_blocked(&self, root: RootId, time: ExpirationTime) -> bool {
        self.roots.get(root).is_some_and(|r| r.is_blocked(time))
    }

    /// Finds a component by name anywhere under `root`.
    pub fn find_component(&self, root: RootId, name: &str) -> Option<FiberId> {
        let root = self.roots.get(root)?;
        self.fibers.find_component(root.root_fiber, name)
    }

    pub fn create_fiber_root(&mut self, container: H::Container) -> RootId {
        // The host-root fiber needs the root's key and the root needs the
        // fiber's key, so link the back-reference after both exist.
        let root_fiber = self.fibers.insert(Fiber::new(
            FiberKind::HostRoot {
                root: RootId::null(),
            },
            None,
        ));
        let current = self.host.create_host_root_node();
        let id = self
            .roots
            .insert(FiberRoot::new(container, root_fiber, current));
        if let Some(fiber) = self.fibers.get_mut(root_fiber) {
            fiber.kind = FiberKind::HostRoot { root: id };
        }
        tracing::info!(?id, "fiber root created");
        id
    }

    /// Replaces the tree under `root` and schedules a pass at `time`.
    pub fn mount(&mut self, root: RootId, element: Element, time: ExpirationTime) {
        let Some(fiber_root) = self.roots.get_mut(root) else {
            tracing::trace!(?root, "mount on unknown root ignored");
            return;
        };
        fiber_root.blockers = None;
        fiber_root.discard_progress();
        let root_fiber = fiber_root.root_fiber;

        for token in self.registry.release_root(root) {
            self.host.cancel_callback(token);
        }
        let removed = self.fibers.clear_children(root_fiber);
        self.fibers.build(element, root_fiber);
        tracing::info!(?root, %time, removed, "mounting tree");

        self.schedule_work(root, time);
    }

    /// Tears down a root. Its pending callbacks are dropped without firing.
    pub fn unmount(&mut self, root: RootId) {
        let Some(fiber_root) = self.roots.remove(root) else {
            tracing::trace!(?root, "unmount on unknown root ignored");
            return;
        };
        self.unlink(root);
        for token in self.registry.release_root(root) {
            self.host.cancel_callback(token);
        }
        let removed = self.fibers.remove_subtree(fiber_root.root_fiber);
        tracing::info!(
            ?root,
            removed,
            dropped_callbacks = fiber_root.pending_callbacks(),
            "root unmounted"
        );
    }

    /// Queues new props for a component and schedules its root.
    pub fn update_component(&mut self, fiber: FiberId, time: ExpirationTime, props: impl Into<String>) {
        let Some(root) = self
            .fibers
            .root_of(fiber)
            .filter(|root| self.roots.contains_key(*root))
        else {
            tracing::trace!(?fiber, "update for detached fiber ignored");
            return;
        };
        self.fibers.enqueue_update(fiber, time, Update::Props(props.into()));
        self.schedule_work(root, time);
    }

    pub fn schedule_work(&mut self, root: RootId, time: ExpirationTime) {
        if time.is_done() {
            tracing::trace!(?root, "schedule at done time ignored");
            return;
        }
        let Some(fiber_root) = self.roots.get_mut(root) else {
            tracing::trace!(?root, %time, "schedule on unknown root ignored");
            return;
        };

        // Progress made at or after `time` did not see this update.
        if fiber_root.wip.as_ref().is_some_and(|wip| time <= wip.expiration) {
            if let Some(wip) = fiber_root.wip.take() {
                tracing::warn!(
                    ?root,
                    interrupted = %wip.expiration,
                    by = %time,
                    units = wip.units,
                    "discarding in-progress pass"
                );
                self.profiling.interruptions += 1;
            }
        }
        if fiber_root.finished.as_ref().is_some_and(|f| time <= f.time) {
            fiber_root.finished = None;
        }

        if fiber_root.schedule(time) {
            self.schedule.push(root);
        }
    }

    /// Registers `callback` to fire once the root has committed work at
    /// `time` or later. Fires immediately if that already happened.
    pub fn register_completion_callback(
        &mut self,
        root: RootId,
        time: ExpirationTime,
        callback: impl FnOnce() + 'static,
    ) {
        let Some(fiber_root) = self.roots.get_mut(root) else {
            tracing::trace!(?root, "callback on unknown root dropped");
            return;
        };
        if !fiber_root.completed_at.is_done() && time <= fiber_root.completed_at {
            callback();
            return;
        }
        let callback: CompletionCallback = Box::new(callback);
        fiber_root.register_completion_callback(time, callback);
    }

    /// Flushes pending work at or before `time` without yielding. Does not
    /// lift blockers.
    pub fn force_expire(&mut self, root: RootId, time: ExpirationTime) {
        let Some(fiber_root) = self.roots.get_mut(root) else {
            tracing::trace!(?root, "force_expire on unknown root ignored");
            return;
        };
        fiber_root.force_expire = Some(fiber_root.force_expire.map_or(time, |limit| limit.max(time)));
    }

    /// Stages a host context that replaces the current one at next commit.
    pub fn set_pending_context(&mut self, root: RootId, context: HostContext) {
        if let Some(fiber_root) = self.roots.get_mut(root) {
            fiber_root.pending_context = Some(context);
        }
    }

    /// Runs one driver turn.
    pub fn perform_work(&mut self) -> Result<WorkStatus, SchedulerError> {
        let started = self.host.now();
        let mut units = 0usize;
        let mut passes = 0usize;

        loop {
            self.process_messages()?;

            let Some((root, time)) = self.next_root() else {
                return Ok(if self.schedule.is_empty() {
                    WorkStatus::Idle
                } else {
                    WorkStatus::Waiting
                });
            };

            passes += 1;
            if passes > self.config.nested_update_limit {
                let error = SchedulerError::SchedulingOverflow { passes: passes - 1 };
                tracing::error!(%error);
                return Err(error);
            }

            match self.work_on_root(root, time, started, &mut units)? {
                RootProgress::Yielded => {
                    self.profiling.yields += 1;
                    return Ok(WorkStatus::Yielded);
                }
                RootProgress::Committed | RootProgress::Blocked => {}
            }
        }
    }

    /// Runs driver turns until nothing can make progress without the host.
    pub fn flush_work(&mut self) -> Result<WorkStatus, SchedulerError> {
        loop {
            match self.perform_work()? {
                WorkStatus::Yielded => continue,
                status => return Ok(status),
            }
        }
    }

    fn process_messages(&mut self) -> Result<(), SchedulerError> {
        while let Ok(msg) = self.receiver.try_recv() {
            match msg {
                SchedulerMsg::Settled(id) => self.on_settled(id)?,
                SchedulerMsg::FallbackExpired(id) => self.on_fallback_expired(id)?,
            }
        }
        Ok(())
    }

    fn on_settled(&mut self, id: SuspensionId) -> Result<(), SchedulerError> {
        let Some(settlement) = self.registry.settle(id) else {
            tracing::trace!(error = %SchedulerError::StaleSuspension(id), "settle ignored");
            return Ok(());
        };
        if let Some(token) = settlement.timer {
            self.host.cancel_callback(token);
        }

        if self.fibers.contains(settlement.fiber) {
            if let Some(root) = self.roots.get_mut(settlement.root) {
                root.discard_progress();
                let retry_at = self.clock.expiration_for(Priority::Async, self.host.now());
                self.fibers.enqueue_update(settlement.fiber, retry_at, Update::Retry);
                self.schedule_work(settlement.root, retry_at);
            }
        }

        self.apply_releases(&settlement.released)
    }

    fn on_fallback_expired(&mut self, id: SuspensionId) -> Result<(), SchedulerError> {
        match self.registry.expire(id, self.host.now()) {
            None => {
                tracing::trace!(?id, "fallback timer for settled suspension ignored");
                Ok(())
            }
            Some(Expiry::FallbackShown(released)) => self.apply_releases(&released),
            Some(Expiry::MissingBoundary { root, waited_ms }) => {
                let error = SchedulerError::MissingFallbackBoundary { root, waited_ms };
                tracing::error!(%error);
                self.host.report_error(&error);
                Ok(())
            }
        }
    }

    /// Clears released blockers and commits any finished work they held.
    fn apply_releases(&mut self, releases: &[Release]) -> Result<(), SchedulerError> {
        for release in releases {
            let Some(root) = self.roots.get_mut(release.root) else {
                continue;
            };
            root.clear_block(release.time);
            let ready = root
                .finished
                .as_ref()
                .filter(|finished| !root.is_blocked(finished.time))
                .map(|finished| finished.time);
            if let Some(time) = ready {
                self.commit_root(release.root, time)?;
            }
        }
        Ok(())
    }

    /// Most urgent root that can make progress. Ties go to the root after
    /// the one served last.
    fn next_root(&mut self) -> Option<(RootId, ExpirationTime)> {
        let len = self.schedule.len();
        let mut best: Option<(usize, RootId, ExpirationTime)> = None;
        for offset in 0..len {
            let index = (self.cursor + offset) % len;
            let id = self.schedule[index];
            let Some(time) = self.roots.get(id).and_then(FiberRoot::next_work_time) else {
                continue;
            };
            if best.is_none_or(|(_, _, best_time)| time < best_time) {
                best = Some((index, id, time));
            }
        }
        let (index, id, time) = best?;
        self.cursor = (index + 1) % len;
        Some((id, time))
    }

    fn unlink(&mut self, root: RootId) {
        if let Some(index) = self.schedule.iter().position(|id| *id == root) {
            self.schedule.remove(index);
            if index < self.cursor {
                self.cursor -= 1;
            }
            if self.cursor >= self.schedule.len() {
                self.cursor = 0;
            }
        }
    }

    fn work_on_root(
        &mut self,
        root: RootId,
        time: ExpirationTime,
        started: f64,
        units: &mut usize,
    ) -> Result<RootProgress, SchedulerError> {
        let current = self.current_time();
        let fiber_root = self
            .roots
            .get_mut(root)
            .ok_or(SchedulerError::UnknownRoot(root))?;
        if fiber_root.has_finished_work() {
            return self.commit_root(root, time);
        }

        let sync = time.is_expired(current) || fiber_root.is_force_expired(time);
        let mut wip = match fiber_root.wip.take() {
            Some(wip) if wip.expiration == time => {
                tracing::debug!(?root, %time, units = wip.units, "resuming pass");
                wip
            }
            stale => {
                if let Some(stale) = stale {
                    tracing::debug!(?root, dropped = %stale.expiration, "restarting at a different time");
                    self.profiling.interruptions += 1;
                }
                tracing::debug!(?root, %time, sync, "starting pass");
                self.profiling.passes += 1;
                WorkInProgress::new(fiber_root.root_fiber, time)
            }
        };

        loop {
            if !sync && *units > 0 && self.host.now() - started >= self.config.frame_budget_ms {
                tracing::debug!(?root, %time, units = wip.units, "frame budget spent, yielding");
                if let Some(fiber_root) = self.roots.get_mut(root) {
                    fiber_root.wip = Some(wip);
                }
                return Ok(RootProgress::Yielded);
            }

            *units += 1;
            self.profiling.units += 1;
            match wip.perform_unit_of_work(&mut self.fibers) {
                UnitOutcome::Continue => {}
                UnitOutcome::Rendered(fiber) => self.on_rendered(fiber)?,
                UnitOutcome::Suspended(request) => self.handle_suspension(root, time, request)?,
                UnitOutcome::Finished(tree) => {
                    tracing::debug!(?root, %time, units = wip.units, "pass complete");
                    if let Some(fiber_root) = self.roots.get_mut(root) {
                        fiber_root.finished = Some(FinishedWork { tree, time });
                    }
                    return self.commit_root(root, time);
                }
            }
        }
    }

    /// A fiber that renders without suspending no longer holds its root.
    fn on_rendered(&mut self, fiber: FiberId) -> Result<(), SchedulerError> {
        let Some(dropped) = self.registry.release_fiber(fiber) else {
            return Ok(());
        };
        if let Some(token) = dropped.timer {
            self.host.cancel_callback(token);
        }
        self.apply_releases(&dropped.released)
    }

    fn handle_suspension(
        &mut self,
        root: RootId,
        time: ExpirationTime,
        request: SuspendRequest,
    ) -> Result<(), SchedulerError> {
        self.profiling.suspensions += 1;
        let now = self.host.now();
        let timeout_ms = match request.boundary {
            Some(_) => request
                .timeout_ms
                .unwrap_or(self.config.default_fallback_timeout_ms),
            None => self.config.missing_boundary_timeout_ms,
        };

        let registration = self.registry.register_suspension(
            root,
            time,
            request.fiber,
            request.boundary,
            &request.dependency,
            now + timeout_ms,
            now,
        );
        tracing::debug!(
            ?root,
            %time,
            fiber = ?request.fiber,
            action = ?registration.action,
            "unit suspended"
        );

        if let Some(token) = registration.cancel_timer {
            self.host.cancel_callback(token);
        }
        // A replaced record may release the time this one blocks again.
        self.apply_releases(&registration.released)?;
        if let Some(blocked) = registration.newly_blocked {
            if let Some(fiber_root) = self.roots.get_mut(root) {
                fiber_root.mark_blocked(blocked);
            }
        }
        if let Some(delay_ms) = registration.arm_timer_ms {
            let sender = self.sender.clone();
            let id = registration.id;
            let token = self.host.schedule_callback(
                delay_ms,
                Box::new(move || {
                    let _ = sender.unbounded_send(SchedulerMsg::FallbackExpired(id));
                }),
            );
            self.registry.set_timer(id, token);
        }
        Ok(())
    }

    fn commit_root(&mut self, root: RootId, time: ExpirationTime) -> Result<RootProgress, SchedulerError> {
        let fiber_root = self
            .roots
            .get_mut(root)
            .ok_or(SchedulerError::UnknownRoot(root))?;

        let committed = match fiber_root.commit(root, time) {
            Ok(committed) => committed,
            Err(SchedulerError::BlockedCommit { .. }) => {
                self.profiling.blocked_commits += 1;
                tracing::debug!(
                    ?root,
                    %time,
                    blocked_at = ?fiber_root.blocked_times(),
                    "commit blocked, holding finished work"
                );
                return Ok(RootProgress::Blocked);
            }
            Err(error) => {
                tracing::error!(%error, "commit failed");
                return Err(error);
            }
        };

        self.fibers.commit_subtree(fiber_root.root_fiber, time);
        self.host
            .apply_committed_tree(&fiber_root.container_info, &fiber_root.current);
        self.profiling.commits += 1;
        devtools().record_commit();
        tracing::info!(
            ?root,
            %time,
            completed_at = %fiber_root.completed_at,
            callbacks = committed.callbacks.len(),
            "committed"
        );

        if !committed.has_remaining_work {
            fiber_root.is_scheduled = false;
            self.unlink(root);
        }
        for callback in committed.callbacks {
            callback();
        }
        Ok(RootProgress::Committed)
    }

    /// Captures scheduler state and publishes it to the devtools context.
    pub fn snapshot(&self) -> DevToolsSnapshot {
        let roots = self
            .roots
            .iter()
            .map(|(id, root)| RootSnapshot {
                id: id.data().as_ffi(),
                scheduled: root.is_scheduled,
                completed_at: root.completed_at.raw(),
                pending: root.pending_times().into_iter().map(ExpirationTime::raw).collect(),
                blocked_at: root.blocked_times().into_iter().map(ExpirationTime::raw).collect(),
                force_expire: root.force_expire.map(ExpirationTime::raw),
                pending_callbacks: root.pending_callbacks(),
                has_finished_work: root.has_finished_work(),
                committed: root.current.to_string(),
            })
            .collect();

        let snapshot = DevToolsSnapshot {
            roots,
            metrics: SchedulerMetrics {
                passes: self.profiling.passes,
                units: self.profiling.units,
                commits: self.profiling.commits,
                blocked_commits: self.profiling.blocked_commits,
                yields: self.profiling.yields,
                interruptions: self.profiling.interruptions,
                suspensions: self.profiling.suspensions,
                outstanding_suspensions: self.registry.len(),
            },
            timestamp_ms: self.host.now(),
        };
        devtools().publish(snapshot.clone());
        snapshot
    }
}

impl<H: Host> Drop for WorkScheduler<H> {
    fn drop(&mut self) {
        let roots: Vec<RootId> = self.roots.keys().collect();
        for root in roots {
            for token in self.registry.release_root(root) {
                self.host.cancel_callback(token);
            }
        }
    }
}
