//! A deterministic host: virtual clock, manual timers and a log of every
//! commit.

use nexa_core::{CancelToken, Host, HostNode, SchedulerError};
use std::cell::RefCell;
use std::rc::Rc;

struct Timer {
    due: f64,
    seq: u64,
    token: CancelToken,
    callback: Box<dyn FnOnce()>,
}

#[derive(Default)]
struct Inner {
    now: f64,
    next_token: u64,
    timers: Vec<Timer>,
    commits: Vec<(String, String)>,
    errors: Vec<SchedulerError>,
}

/// Clones share one clock, so a test can keep a handle while the scheduler
/// owns another.
#[derive(Clone, Default)]
pub struct TestHost {
    inner: Rc<RefCell<Inner>>,
}

impl TestHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward without firing timers.
    pub fn tick(&self, ms: f64) {
        self.inner.borrow_mut().now += ms;
    }

    /// Moves the clock forward, firing due timers in order.
    pub fn advance(&self, ms: f64) {
        let target = self.inner.borrow().now + ms;
        loop {
            let next = {
                let mut inner = self.inner.borrow_mut();
                let due = inner
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, timer)| timer.due <= target)
                    .min_by(|(_, a), (_, b)| a.due.total_cmp(&b.due).then(a.seq.cmp(&b.seq)))
                    .map(|(index, _)| index);
                due.map(|index| {
                    let timer = inner.timers.remove(index);
                    inner.now = inner.now.max(timer.due);
                    timer.callback
                })
            };
            // Fired outside the borrow; callbacks may schedule more timers.
            match next {
                Some(callback) => callback(),
                None => break,
            }
        }
        self.inner.borrow_mut().now = target;
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.borrow().timers.len()
    }

    /// Markup of every commit, oldest first, across all containers.
    pub fn commits(&self) -> Vec<String> {
        self.inner
            .borrow()
            .commits
            .iter()
            .map(|(_, markup)| markup.clone())
            .collect()
    }

    pub fn commits_for(&self, container: &str) -> Vec<String> {
        self.inner
            .borrow()
            .commits
            .iter()
            .filter(|(c, _)| c == container)
            .map(|(_, markup)| markup.clone())
            .collect()
    }

    pub fn last_output(&self, container: &str) -> Option<String> {
        self.commits_for(container).pop()
    }

    pub fn errors(&self) -> Vec<SchedulerError> {
        self.inner.borrow().errors.clone()
    }
}

impl Host for TestHost {
    type Container = String;

    fn create_host_root_node(&self) -> HostNode {
        HostNode::empty_root()
    }

    fn apply_committed_tree(&self, container: &String, tree: &HostNode) {
        self.inner
            .borrow_mut()
            .commits
            .push((container.clone(), tree.to_string()));
    }

    fn schedule_callback(&self, delay_ms: f64, callback: Box<dyn FnOnce()>) -> CancelToken {
        let mut inner = self.inner.borrow_mut();
        inner.next_token += 1;
        let token = CancelToken(inner.next_token);
        let timer = Timer {
            due: inner.now + delay_ms.max(0.0),
            seq: inner.next_token,
            token,
            callback,
        };
        inner.timers.push(timer);
        token
    }

    fn cancel_callback(&self, token: CancelToken) {
        self.inner
            .borrow_mut()
            .timers
            .retain(|timer| timer.token != token);
    }

    fn now(&self) -> f64 {
        self.inner.borrow().now
    }

    fn report_error(&self, error: &SchedulerError) {
        tracing::error!(%error, "reported to test host");
        self.inner.borrow_mut().errors.push(error.clone());
    }
}
