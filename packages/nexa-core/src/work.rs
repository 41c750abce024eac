use crate::fiber::{FiberArena, FiberId, FiberKind, Rendered};
use crate::host::HostNode;
use nexa_scheduler::{Dependency, ExpirationTime, Step};

/// A leaf that could not complete during a pass.
pub(crate) struct SuspendRequest {
    pub fiber: FiberId,
    pub boundary: Option<FiberId>,
    pub timeout_ms: Option<f64>,
    pub dependency: Dependency,
}

pub(crate) enum UnitOutcome {
    Continue,
    /// A leaf rendered without suspending.
    Rendered(FiberId),
    Suspended(SuspendRequest),
    Finished(HostNode),
}

enum FrameKind {
    Root,
    Host(&'static str),
    Boundary {
        fallback: String,
        timeout_ms: Option<f64>,
    },
}

struct Frame {
    fiber: FiberId,
    kind: FrameKind,
    next_child: usize,
    output: Vec<HostNode>,
    suspended: bool,
}

/// One interruptible pass over a root's work tree at a fixed expiration
/// time. Each call to [`WorkInProgress::perform_unit_of_work`] visits one
/// fiber, so the driver can stop between any two units.
pub(crate) struct WorkInProgress {
    pub expiration: ExpirationTime,
    pub units: usize,
    stack: Vec<Frame>,
}

impl WorkInProgress {
    pub fn new(root_fiber: FiberId, expiration: ExpirationTime) -> Self {
        Self {
            expiration,
            units: 0,
            stack: vec![Frame {
                fiber: root_fiber,
                kind: FrameKind::Root,
                next_child: 0,
                output: Vec::new(),
                suspended: false,
            }],
        }
    }

    pub fn perform_unit_of_work(&mut self, fibers: &mut FiberArena) -> UnitOutcome {
        self.units += 1;

        let Some(top) = self.stack.last_mut() else {
            return UnitOutcome::Finished(HostNode::empty_root());
        };

        let next = fibers
            .get(top.fiber)
            .and_then(|fiber| fiber.children.get(top.next_child).copied());

        let Some(child) = next else {
            return self.complete_frame();
        };
        top.next_child += 1;

        let Some(fiber) = fibers.get(child) else {
            return UnitOutcome::Continue;
        };

        if fiber.is_leaf() {
            let (node, outcome) = match begin_leaf(fibers, child, self.expiration) {
                Leaf::Reused(node) => (node, UnitOutcome::Continue),
                Leaf::Rendered(Step::Complete(node)) => (node, UnitOutcome::Rendered(child)),
                Leaf::Rendered(Step::Suspended(dependency)) => {
                    return self.suspend(child, dependency);
                }
            };
            if let Some(top) = self.stack.last_mut() {
                top.output.push(node);
            }
            return outcome;
        }

        let kind = match &fiber.kind {
            FiberKind::Host { tag } => FrameKind::Host(*tag),
            FiberKind::Boundary {
                fallback,
                timeout_ms,
            } => FrameKind::Boundary {
                fallback: fallback.clone(),
                timeout_ms: *timeout_ms,
            },
            FiberKind::HostRoot { .. } | FiberKind::Text(_) | FiberKind::Component { .. } => {
                tracing::warn!(?child, "unexpected fiber in structural position, skipping");
                return UnitOutcome::Continue;
            }
        };

        self.stack.push(Frame {
            fiber: child,
            kind,
            next_child: 0,
            output: Vec::new(),
            suspended: false,
        });
        UnitOutcome::Continue
    }

    fn suspend(&mut self, fiber: FiberId, dependency: Dependency) -> UnitOutcome {
        let boundary = self
            .stack
            .iter_mut()
            .rev()
            .find(|frame| matches!(frame.kind, FrameKind::Boundary { .. }));

        let (boundary, timeout_ms) = match boundary {
            Some(frame) => {
                frame.suspended = true;
                let timeout_ms = match &frame.kind {
                    FrameKind::Boundary { timeout_ms, .. } => *timeout_ms,
                    _ => None,
                };
                (Some(frame.fiber), timeout_ms)
            }
            None => (None, None),
        };

        UnitOutcome::Suspended(SuspendRequest {
            fiber,
            boundary,
            timeout_ms,
            dependency,
        })
    }

    fn complete_frame(&mut self) -> UnitOutcome {
        let Some(frame) = self.stack.pop() else {
            return UnitOutcome::Finished(HostNode::empty_root());
        };

        let mut produced = match frame.kind {
            FrameKind::Root => {
                return UnitOutcome::Finished(HostNode::Root {
                    children: frame.output,
                });
            }
            FrameKind::Host(tag) => vec![HostNode::element(tag, frame.output)],
            FrameKind::Boundary { fallback, .. } if frame.suspended => {
                vec![HostNode::Text(fallback)]
            }
            FrameKind::Boundary { .. } => frame.output,
        };

        if let Some(parent) = self.stack.last_mut() {
            parent.output.append(&mut produced);
        }
        UnitOutcome::Continue
    }
}

enum Leaf {
    /// Committed output, untouched by this pass.
    Reused(HostNode),
    Rendered(Step<HostNode>),
}

/// Renders one leaf at `expiration`, or reuses its committed output when
/// nothing at or before `expiration` touched it. Rendering never changes
/// committed props; the result waits in [`Fiber::rendered`] until commit.
///
/// [`Fiber::rendered`]: crate::fiber::Fiber::rendered
fn begin_leaf(fibers: &mut FiberArena, id: FiberId, expiration: ExpirationTime) -> Leaf {
    let Some(fiber) = fibers.get_mut(id) else {
        return Leaf::Reused(HostNode::empty_root());
    };

    if !fiber.updates.has_work_at(expiration) {
        if let Some(memoized) = &fiber.memoized {
            let memoized = memoized.clone();
            fiber.rendered = None;
            return Leaf::Reused(memoized);
        }
    }

    let step = match (&fiber.kind, fiber.props_at(expiration)) {
        (FiberKind::Text(text), _) => Step::Complete(HostNode::Text(text.clone())),
        (FiberKind::Component { render, .. }, Some(props)) => {
            fiber.render_count += 1;
            (**render)(props.as_str())
        }
        _ => Step::Complete(HostNode::empty_root()),
    };

    fiber.rendered = Some(Rendered {
        time: expiration,
        output: match &step {
            Step::Complete(node) => Some(node.clone()),
            Step::Suspended(_) => None,
        },
    });
    Leaf::Rendered(step)
}
