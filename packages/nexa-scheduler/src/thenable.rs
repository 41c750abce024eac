use smallvec::SmallVec;
use std::cell::RefCell;
use std::rc::Rc;

/// Anything a unit of work can wait on.
///
/// The settle callback carries no payload: success and failure both just
/// mean "try again".
pub trait Thenable {
    fn then(&self, on_settle: Box<dyn FnOnce()>);
}

pub type Dependency = Rc<dyn Thenable>;

/// Stable identity of a dependency while it is alive.
pub fn dependency_key(dependency: &Dependency) -> usize {
    Rc::as_ptr(dependency) as *const () as usize
}

/// Result of one unit of work.
pub enum Step<T> {
    Complete(T),
    Suspended(Dependency),
}

impl<T> Step<T> {
    pub fn is_suspended(&self) -> bool {
        matches!(self, Step::Suspended(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredState {
    Pending,
    Resolved,
    Rejected,
}

struct DeferredInner {
    state: DeferredState,
    callbacks: SmallVec<[Box<dyn FnOnce()>; 2]>,
}

/// A single-threaded promise. Settles once; continuations run on settle,
/// or straight away if it already has.
#[derive(Clone)]
pub struct Deferred {
    inner: Rc<RefCell<DeferredInner>>,
}

impl Default for Deferred {
    fn default() -> Self {
        Self::new()
    }
}

impl Deferred {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(DeferredInner {
                state: DeferredState::Pending,
                callbacks: SmallVec::new(),
            })),
        }
    }

    pub fn state(&self) -> DeferredState {
        self.inner.borrow().state
    }

    pub fn is_settled(&self) -> bool {
        self.state() != DeferredState::Pending
    }

    pub fn resolve(&self) {
        self.settle(DeferredState::Resolved);
    }

    pub fn reject(&self) {
        self.settle(DeferredState::Rejected);
    }

    /// Type-erased handle to hand out from a render function. Every call
    /// returns the same dependency.
    pub fn dependency(&self) -> Dependency {
        self.inner.clone()
    }

    fn settle(&self, state: DeferredState) {
        let callbacks = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != DeferredState::Pending {
                return;
            }
            inner.state = state;
            std::mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            callback();
        }
    }
}

impl Thenable for RefCell<DeferredInner> {
    fn then(&self, on_settle: Box<dyn FnOnce()>) {
        let mut inner = self.borrow_mut();
        if inner.state == DeferredState::Pending {
            inner.callbacks.push(on_settle);
        } else {
            drop(inner);
            on_settle();
        }
    }
}

impl Thenable for Deferred {
    fn then(&self, on_settle: Box<dyn FnOnce()>) {
        self.inner.then(on_settle);
    }
}
