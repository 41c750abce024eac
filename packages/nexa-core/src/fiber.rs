use crate::host::HostNode;
use crate::root::RootId;
use nexa_scheduler::{ExpirationTime, MergePolicy, Step, UpdateQueue};
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;
use std::fmt;
use std::rc::Rc;

new_key_type! {
    pub struct FiberId;
}

pub type RenderFn = Rc<dyn Fn(&str) -> Step<HostNode>>;

/// Declarative description of a tree, turned into fibers at mount.
#[derive(Clone)]
pub enum Element {
    Host {
        tag: &'static str,
        children: Vec<Element>,
    },
    Text(String),
    Component {
        name: &'static str,
        props: String,
        render: RenderFn,
    },
    Boundary {
        fallback: String,
        timeout_ms: Option<f64>,
        children: Vec<Element>,
    },
}

impl Element {
    pub fn host(tag: &'static str, children: Vec<Element>) -> Self {
        Element::Host { tag, children }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Element::Text(text.into())
    }

    pub fn component(
        name: &'static str,
        props: impl Into<String>,
        render: impl Fn(&str) -> Step<HostNode> + 'static,
    ) -> Self {
        Element::Component {
            name,
            props: props.into(),
            render: Rc::new(render),
        }
    }

    pub fn boundary(fallback: impl Into<String>, children: Vec<Element>) -> Self {
        Element::Boundary {
            fallback: fallback.into(),
            timeout_ms: None,
            children,
        }
    }

    pub fn boundary_with_timeout(
        fallback: impl Into<String>,
        timeout_ms: f64,
        children: Vec<Element>,
    ) -> Self {
        Element::Boundary {
            fallback: fallback.into(),
            timeout_ms: Some(timeout_ms),
            children,
        }
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Host { tag, children } => f
                .debug_struct("Host")
                .field("tag", tag)
                .field("children", children)
                .finish(),
            Element::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Element::Component { name, props, .. } => f
                .debug_struct("Component")
                .field("name", name)
                .field("props", props)
                .finish_non_exhaustive(),
            Element::Boundary {
                fallback,
                timeout_ms,
                children,
            } => f
                .debug_struct("Boundary")
                .field("fallback", fallback)
                .field("timeout_ms", timeout_ms)
                .field("children", children)
                .finish(),
        }
    }
}

/// Pending change to a component.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Props(String),
    /// Render again with the current props, e.g. after a dependency settled.
    Retry,
}

fn merge_update(existing: &mut Update, incoming: Update) -> Option<Update> {
    // A retry at the same time is implied by any queued props change.
    if !matches!(incoming, Update::Retry) {
        *existing = incoming;
    }
    None
}

pub enum FiberKind {
    /// Top of a root's tree. `root` is a lookup key, not an owner.
    HostRoot { root: RootId },
    Host { tag: &'static str },
    Text(String),
    Component {
        name: &'static str,
        props: String,
        render: RenderFn,
    },
    Boundary { fallback: String, timeout_ms: Option<f64> },
}

/// Output a pass rendered for a leaf, not yet committed.
pub struct Rendered {
    pub time: ExpirationTime,
    pub output: Option<HostNode>,
}

pub struct Fiber {
    /// For components, `props` here are the committed props.
    pub kind: FiberKind,
    pub parent: Option<FiberId>,
    pub children: SmallVec<[FiberId; 4]>,
    pub updates: UpdateQueue<Update>,
    /// Output as of the last commit.
    pub memoized: Option<HostNode>,
    pub rendered: Option<Rendered>,
    pub render_count: u64,
}

impl Fiber {
    pub fn new(kind: FiberKind, parent: Option<FiberId>) -> Self {
        Self {
            kind,
            parent,
            children: SmallVec::new(),
            updates: UpdateQueue::with_policy(MergePolicy::Custom(merge_update)),
            memoized: None,
            rendered: None,
            render_count: 0,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, FiberKind::Text(_) | FiberKind::Component { .. })
    }

    /// Props a pass at `time` sees: committed props with every queued
    /// update at or before `time` applied.
    pub fn props_at(&self, time: ExpirationTime) -> Option<String> {
        let FiberKind::Component { props, .. } = &self.kind else {
            return None;
        };
        let props = self
            .updates
            .iter_up_to(time)
            .fold(props, |current, update| match update {
                Update::Props(next) => next,
                Update::Retry => current,
            });
        Some(props.clone())
    }

    /// Folds updates at or before `time` into the committed props and
    /// promotes output rendered by the pass at `time`.
    fn commit(&mut self, time: ExpirationTime) {
        let Fiber {
            kind,
            updates,
            memoized,
            rendered,
            ..
        } = self;
        for update in updates.drain_up_to(time) {
            if let (FiberKind::Component { props, .. }, Update::Props(next)) = (&mut *kind, update) {
                *props = next;
            }
        }
        if let Some(rendered) = rendered.take().filter(|r| r.time == time) {
            *memoized = rendered.output;
        }
    }
}

#[derive(Default)]
pub struct FiberArena {
    nodes: SlotMap<FiberId, Fiber>,
}

impl FiberArena {
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
        }
    }

    pub fn insert(&mut self, fiber: Fiber) -> FiberId {
        self.nodes.insert(fiber)
    }

    pub fn get(&self, id: FiberId) -> Option<&Fiber> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: FiberId) -> Option<&mut Fiber> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: FiberId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Builds fibers for `element` under `parent` and links them in.
    pub fn build(&mut self, element: Element, parent: FiberId) -> FiberId {
        let (kind, children) = match element {
            Element::Host { tag, children } => (FiberKind::Host { tag }, children),
            Element::Text(text) => (FiberKind::Text(text), Vec::new()),
            Element::Component {
                name,
                props,
                render,
            } => (
                FiberKind::Component {
                    name,
                    props,
                    render,
                },
                Vec::new(),
            ),
            Element::Boundary {
                fallback,
                timeout_ms,
                children,
            } => (
                FiberKind::Boundary {
                    fallback,
                    timeout_ms,
                },
                children,
            ),
        };

        let id = self.insert(Fiber::new(kind, Some(parent)));
        if let Some(parent) = self.nodes.get_mut(parent) {
            parent.children.push(id);
        }
        for child in children {
            self.build(child, id);
        }
        id
    }

    /// Removes every descendant of `id`, keeping `id` itself.
    pub fn clear_children(&mut self, id: FiberId) -> usize {
        let children = match self.nodes.get_mut(id) {
            Some(fiber) => std::mem::take(&mut fiber.children),
            None => return 0,
        };
        children.into_iter().map(|child| self.remove_subtree(child)).sum()
    }

    /// Removes `id` and everything below it.
    pub fn remove_subtree(&mut self, id: FiberId) -> usize {
        let mut stack = vec![id];
        let mut removed = 0;
        while let Some(next) = stack.pop() {
            if let Some(fiber) = self.nodes.remove(next) {
                stack.extend(fiber.children);
                removed += 1;
            }
        }
        removed
    }

    /// Walks parent links up to the host root and returns its root.
    pub fn root_of(&self, id: FiberId) -> Option<RootId> {
        let mut current = id;
        loop {
            let fiber = self.nodes.get(current)?;
            match (&fiber.kind, fiber.parent) {
                (FiberKind::HostRoot { root }, _) => return Some(*root),
                (_, Some(parent)) => current = parent,
                (_, None) => return None,
            }
        }
    }

    /// Finds the first component with the given name in a subtree.
    pub fn find_component(&self, from: FiberId, name: &str) -> Option<FiberId> {
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            let fiber = self.nodes.get(id)?;
            if let FiberKind::Component { name: n, .. } = &fiber.kind {
                if *n == name {
                    return Some(id);
                }
            }
            stack.extend(fiber.children.iter().rev().copied());
        }
        None
    }

    /// Makes the pass at `time` the committed state of every fiber under
    /// `from`.
    pub fn commit_subtree(&mut self, from: FiberId, time: ExpirationTime) {
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            let Some(fiber) = self.nodes.get_mut(id) else {
                continue;
            };
            stack.extend(fiber.children.iter().copied());
            fiber.commit(time);
        }
    }

    /// Queues new props, dropping queued work at `time` or later.
    pub fn enqueue_update(&mut self, id: FiberId, time: ExpirationTime, update: Update) -> bool {
        let Some(fiber) = self.nodes.get_mut(id) else {
            return false;
        };
        if let Update::Props(_) = update {
            let superseded = fiber.updates.discard_from(time);
            if superseded > 0 {
                tracing::trace!(?id, superseded, "pending updates superseded");
            }
        }
        fiber.updates.enqueue(time, update);
        true
    }
}
