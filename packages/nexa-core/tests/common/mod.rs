#![allow(dead_code)]

mod host;

pub use host::TestHost;
use nexa_core::{Deferred, Element, HostNode, Step};
use std::cell::RefCell;
use std::rc::Rc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A leaf that shows `text` once `gate` resolves and suspends on it until then.
pub fn resource(name: &'static str, text: &'static str, gate: &Deferred) -> Element {
    let gate = gate.clone();
    Element::component(name, "", move |_| {
        if gate.is_settled() {
            Step::Complete(HostNode::text(text))
        } else {
            Step::Suspended(gate.dependency())
        }
    })
}

/// Like [`resource`], but each render costs `cost_ms` of host time.
pub fn timed_resource(
    name: &'static str,
    text: &'static str,
    gate: &Deferred,
    host: &TestHost,
    cost_ms: f64,
) -> Element {
    let gate = gate.clone();
    let host = host.clone();
    Element::component(name, "", move |_| {
        host.tick(cost_ms);
        if gate.is_settled() {
            Step::Complete(HostNode::text(text))
        } else {
            Step::Suspended(gate.dependency())
        }
    })
}

/// A leaf that renders its props, except `"slow"`, which waits on `gate`.
pub fn switchable(name: &'static str, props: &'static str, gate: &Deferred) -> Element {
    let gate = gate.clone();
    Element::component(name, props, move |props| {
        if props == "slow" && !gate.is_settled() {
            Step::Suspended(gate.dependency())
        } else {
            Step::Complete(HostNode::text(props))
        }
    })
}

/// A leaf that renders its props.
pub fn label(name: &'static str, props: &'static str) -> Element {
    Element::component(name, props, |props| Step::Complete(HostNode::text(props)))
}

/// A leaf that costs `cost_ms` of host time to render and logs its name.
pub fn slow(
    name: &'static str,
    host: &TestHost,
    cost_ms: f64,
    log: &Rc<RefCell<Vec<&'static str>>>,
) -> Element {
    let host = host.clone();
    let log = log.clone();
    Element::component(name, name, move |props| {
        host.tick(cost_ms);
        log.borrow_mut().push(name);
        Step::Complete(HostNode::text(props))
    })
}
