use crate::error::SchedulerError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle returned by [`Host::schedule_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelToken(pub u64);

/// Output tree handed to the render target at commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostNode {
    Root { children: Vec<HostNode> },
    Element { tag: String, children: Vec<HostNode> },
    Text(String),
}

impl HostNode {
    pub fn empty_root() -> Self {
        HostNode::Root {
            children: Vec::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        HostNode::Text(text.into())
    }

    pub fn element(tag: impl Into<String>, children: Vec<HostNode>) -> Self {
        HostNode::Element {
            tag: tag.into(),
            children,
        }
    }
}

impl fmt::Display for HostNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostNode::Root { children } => children.iter().try_for_each(|c| write!(f, "{}", c)),
            HostNode::Element { tag, children } => {
                write!(f, "<{}>", tag)?;
                children.iter().try_for_each(|c| write!(f, "{}", c))?;
                write!(f, "</{}>", tag)
            }
            HostNode::Text(text) => write!(f, "{}", text),
        }
    }
}

/// Everything the scheduler needs from its environment.
///
/// Hosts are single-threaded and take `&self`; implementations use interior
/// mutability the same way a local task queue does.
pub trait Host {
    /// Opaque handle for the place a root renders into.
    type Container: Clone + fmt::Debug;

    /// The empty tree a fresh root starts out with.
    fn create_host_root_node(&self) -> HostNode;

    /// Make `tree` the visible content of `container`.
    fn apply_committed_tree(&self, container: &Self::Container, tree: &HostNode);

    /// Run `callback` after `delay_ms`. The callback must not call back
    /// into the scheduler.
    fn schedule_callback(&self, delay_ms: f64, callback: Box<dyn FnOnce()>) -> CancelToken;

    fn cancel_callback(&self, token: CancelToken);

    /// Monotonic time in milliseconds.
    fn now(&self) -> f64;

    /// Configuration problems the scheduler cannot resolve on its own.
    fn report_error(&self, error: &SchedulerError) {
        tracing::error!(%error, "scheduler error reported to host");
    }
}
