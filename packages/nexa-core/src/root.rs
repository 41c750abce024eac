//! Per-root scheduling state.
//!
//! A [`FiberRoot`] owns the committed output of one mounted tree plus the
//! queues that decide when new output may replace it: pending work times,
//! blockers that hold commits back, and one-shot completion callbacks.

use crate::error::SchedulerError;
use crate::fiber::FiberId;
use crate::host::HostNode;
use crate::work::WorkInProgress;
use nexa_scheduler::{ExpirationTime, MergePolicy, UpdateQueue, min_time_of};
use slotmap::new_key_type;
use std::any::Any;
use std::rc::Rc;

new_key_type! {
    pub struct RootId;
}

pub type CompletionCallback = Box<dyn FnOnce()>;

/// Opaque host context swapped in at commit.
pub type HostContext = Rc<dyn Any>;

/// A pass that ran to completion but has not been committed.
pub struct FinishedWork {
    pub tree: HostNode,
    pub time: ExpirationTime,
}

pub struct Committed {
    pub callbacks: Vec<CompletionCallback>,
    pub has_remaining_work: bool,
}

pub struct FiberRoot<C> {
    pub container_info: C,
    /// The only externally visible tree.
    pub current: HostNode,
    /// Top fiber of this root's work tree.
    pub root_fiber: FiberId,
    pub is_scheduled: bool,
    pub completed_at: ExpirationTime,
    pub blockers: Option<UpdateQueue<()>>,
    pub completion_callbacks: Option<UpdateQueue<CompletionCallback>>,
    pub force_expire: Option<ExpirationTime>,
    pub context: Option<HostContext>,
    pub pending_context: Option<HostContext>,
    pub(crate) pending: UpdateQueue<()>,
    pub(crate) wip: Option<WorkInProgress>,
    pub(crate) finished: Option<FinishedWork>,
}

impl<C> FiberRoot<C> {
    pub fn new(container_info: C, root_fiber: FiberId, current: HostNode) -> Self {
        Self {
            container_info,
            current,
            root_fiber,
            is_scheduled: false,
            completed_at: ExpirationTime::DONE,
            blockers: None,
            completion_callbacks: None,
            force_expire: None,
            context: None,
            pending_context: None,
            pending: UpdateQueue::new(),
            wip: None,
            finished: None,
        }
    }

    pub fn is_blocked(&self, time: ExpirationTime) -> bool {
        is_root_blocked(self, time)
    }

    pub fn mark_blocked(&mut self, time: ExpirationTime) {
        self.blockers
            .get_or_insert_with(UpdateQueue::new)
            .enqueue(time, ());
    }

    pub fn clear_block(&mut self, time: ExpirationTime) {
        if let Some(blockers) = self.blockers.as_mut() {
            blockers.remove(time);
            if blockers.is_empty() {
                self.blockers = None;
            }
        }
    }

    pub fn blocked_times(&self) -> Vec<ExpirationTime> {
        self.blockers
            .as_ref()
            .map(|b| b.times().collect())
            .unwrap_or_default()
    }

    pub fn register_completion_callback(&mut self, time: ExpirationTime, callback: CompletionCallback) {
        self.completion_callbacks
            .get_or_insert_with(|| UpdateQueue::with_policy(MergePolicy::Append))
            .enqueue(time, callback);
    }

    pub fn pending_callbacks(&self) -> usize {
        self.completion_callbacks.as_ref().map_or(0, UpdateQueue::len)
    }

    /// Records `time` as pending. Returns true if the root must be linked
    /// into the schedule.
    pub(crate) fn schedule(&mut self, time: ExpirationTime) -> bool {
        self.pending.enqueue(time, ());
        !std::mem::replace(&mut self.is_scheduled, true)
    }

    pub fn pending_time(&self) -> ExpirationTime {
        self.pending.min_time()
    }

    pub fn pending_times(&self) -> Vec<ExpirationTime> {
        self.pending.times().collect()
    }

    pub fn has_finished_work(&self) -> bool {
        self.finished.is_some()
    }

    /// Drops in-progress and cached work so the next pass starts clean.
    pub(crate) fn discard_progress(&mut self) {
        self.wip = None;
        self.finished = None;
    }

    /// The time this root wants to work at next, if any. A root holding
    /// finished work that is still blocked waits.
    pub(crate) fn next_work_time(&self) -> Option<ExpirationTime> {
        if let Some(finished) = &self.finished {
            return (!self.is_blocked(finished.time)).then_some(finished.time);
        }
        let time = self.pending.min_time();
        (!time.is_done()).then_some(time)
    }

    pub(crate) fn is_force_expired(&self, time: ExpirationTime) -> bool {
        self.force_expire
            .is_some_and(|limit| !time.is_done() && time <= limit)
    }

    /// Makes the cached finished work the current tree.
    ///
    /// Fails with [`SchedulerError::BlockedCommit`] while a blocker at or
    /// before `time` is outstanding; the finished work stays cached.
    pub fn commit(&mut self, id: RootId, time: ExpirationTime) -> Result<Committed, SchedulerError> {
        if self.is_blocked(time) {
            return Err(SchedulerError::BlockedCommit { root: id, time });
        }
        let finished = self
            .finished
            .take()
            .ok_or(SchedulerError::NothingToCommit(id))?;

        self.current = finished.tree;
        if let Some(context) = self.pending_context.take() {
            self.context = Some(context);
        }
        self.completed_at = self.completed_at.max(time);

        let mut callbacks = Vec::new();
        if let Some(queue) = self.completion_callbacks.as_mut() {
            callbacks.extend(queue.drain_up_to(self.completed_at));
            if queue.is_empty() {
                self.completion_callbacks = None;
            }
        }

        self.pending.drain_up_to(time).for_each(drop);
        if self.force_expire.is_some_and(|limit| !self.pending.has_work_at(limit)) {
            self.force_expire = None;
        }

        Ok(Committed {
            callbacks,
            has_remaining_work: !self.pending.is_empty() || self.wip.is_some(),
        })
    }
}

/// True when the root holds a blocker at or before `time`.
pub fn is_root_blocked<C>(root: &FiberRoot<C>, time: ExpirationTime) -> bool {
    let blocked_at = min_time_of(root.blockers.as_ref());
    !blocked_at.is_done() && blocked_at <= time
}
