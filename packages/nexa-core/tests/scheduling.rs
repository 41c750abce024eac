mod common;

use common::{TestHost, init_tracing, slow};
use nexa_core::{
    Element, ExpirationTime, Priority, SchedulerConfig, SchedulerError, WorkScheduler, WorkStatus,
};
use std::cell::RefCell;
use std::rc::Rc;

type Log = Rc<RefCell<Vec<&'static str>>>;

fn setup() -> (TestHost, WorkScheduler<TestHost>, Log) {
    init_tracing();
    let host = TestHost::new();
    let scheduler = WorkScheduler::new(host.clone());
    (host, scheduler, Log::default())
}

#[test]
fn async_pass_yields_when_budget_spent() {
    let (host, mut scheduler, log) = setup();
    let root = scheduler.create_fiber_root("main".to_string());
    let children = ["a", "b", "c", "d"]
        .into_iter()
        .map(|name| slow(name, &host, 3.0, &log))
        .collect();
    let at = scheduler.request_expiration(Priority::Async);
    scheduler.mount(root, Element::host("ul", children), at);

    assert_eq!(scheduler.perform_work().unwrap(), WorkStatus::Yielded);
    assert_eq!(*log.borrow(), vec!["a", "b"]);
    assert!(host.commits().is_empty());

    assert_eq!(scheduler.flush_work().unwrap(), WorkStatus::Idle);
    assert_eq!(host.commits(), vec!["<ul>abcd</ul>"]);
    assert_eq!(*log.borrow(), vec!["a", "b", "c", "d"]);
    assert!(scheduler.profiling.yields >= 2);
    assert_eq!(scheduler.profiling.passes, 1);
}

#[test]
fn sync_pass_never_yields() {
    let (host, mut scheduler, log) = setup();
    let root = scheduler.create_fiber_root("main".to_string());
    let children = ["a", "b", "c", "d"]
        .into_iter()
        .map(|name| slow(name, &host, 3.0, &log))
        .collect();
    scheduler.mount(root, Element::host("ul", children), ExpirationTime::SYNC);

    assert_eq!(scheduler.perform_work().unwrap(), WorkStatus::Idle);
    assert_eq!(host.commits(), vec!["<ul>abcd</ul>"]);
    assert_eq!(scheduler.profiling.yields, 0);
}

#[test]
fn force_expire_flushes_async_work_in_one_turn() {
    let (host, mut scheduler, log) = setup();
    let root = scheduler.create_fiber_root("main".to_string());
    let children = ["a", "b", "c", "d"]
        .into_iter()
        .map(|name| slow(name, &host, 3.0, &log))
        .collect();
    let at = scheduler.request_expiration(Priority::Async);
    scheduler.mount(root, Element::host("ul", children), at);
    scheduler.force_expire(root, at);

    assert_eq!(scheduler.perform_work().unwrap(), WorkStatus::Idle);
    assert_eq!(host.commits().len(), 1);
    assert_eq!(scheduler.profiling.yields, 0);
    assert!(scheduler.root(root).unwrap().force_expire.is_none());
}

#[test]
fn roots_with_equal_priority_take_turns() {
    let (host, mut scheduler, log) = setup();
    let at = scheduler.request_expiration(Priority::Async);
    for (container, names) in [("left", ["a1", "a2", "a3", "a4"]), ("right", ["b1", "b2", "b3", "b4"])] {
        let root = scheduler.create_fiber_root(container.to_string());
        let children = names
            .into_iter()
            .map(|name| slow(name, &host, 3.0, &log))
            .collect();
        scheduler.mount(root, Element::host("div", children), at);
    }

    assert_eq!(scheduler.flush_work().unwrap(), WorkStatus::Idle);
    assert_eq!(
        *log.borrow(),
        vec!["a1", "a2", "b1", "b2", "a3", "a4", "b3", "b4"]
    );
    assert_eq!(host.last_output("left").as_deref(), Some("<div>a1a2a3a4</div>"));
    assert_eq!(host.last_output("right").as_deref(), Some("<div>b1b2b3b4</div>"));
}

#[test]
fn urgent_update_interrupts_async_pass() {
    let (host, mut scheduler, log) = setup();
    let root = scheduler.create_fiber_root("main".to_string());
    let children = ["a", "b", "c", "d"]
        .into_iter()
        .map(|name| slow(name, &host, 3.0, &log))
        .collect();
    let at = scheduler.request_expiration(Priority::Async);
    scheduler.mount(root, Element::host("ul", children), at);
    assert_eq!(scheduler.perform_work().unwrap(), WorkStatus::Yielded);

    let a = scheduler.find_component(root, "a").unwrap();
    scheduler.update_component(a, ExpirationTime::SYNC, "urgent");
    assert_eq!(scheduler.profiling.interruptions, 1);

    scheduler.flush_work().unwrap();
    let commits = host.commits();
    assert_eq!(commits[0], "<ul>urgentbcd</ul>");
    assert_eq!(commits.last().map(String::as_str), Some("<ul>urgentbcd</ul>"));
}

#[test]
fn sync_commit_leaves_out_less_urgent_updates() {
    let (host, mut scheduler, log) = setup();
    let root = scheduler.create_fiber_root("main".to_string());
    let children = ["a", "b", "c"]
        .into_iter()
        .map(|name| slow(name, &host, 3.0, &log))
        .collect();
    scheduler.mount(root, Element::host("ul", children), ExpirationTime::SYNC);
    scheduler.flush_work().unwrap();

    let at = scheduler.request_expiration(Priority::Async);
    for (name, props) in [("a", "a-async"), ("b", "b-async")] {
        let fiber = scheduler.find_component(root, name).unwrap();
        scheduler.update_component(fiber, at, props);
    }
    assert_eq!(scheduler.perform_work().unwrap(), WorkStatus::Yielded);

    let c = scheduler.find_component(root, "c").unwrap();
    scheduler.update_component(c, ExpirationTime::SYNC, "c-sync");
    assert_eq!(scheduler.profiling.interruptions, 1);

    assert_eq!(scheduler.flush_work().unwrap(), WorkStatus::Idle);
    assert_eq!(
        host.commits(),
        vec![
            "<ul>abc</ul>",
            "<ul>abc-sync</ul>",
            "<ul>a-asyncb-asyncc-sync</ul>",
        ]
    );
}

#[test]
fn later_props_win_at_equal_time() {
    let (host, mut scheduler, log) = setup();
    let root = scheduler.create_fiber_root("main".to_string());
    scheduler.mount(root, slow("a", &host, 0.0, &log), ExpirationTime::SYNC);
    scheduler.flush_work().unwrap();

    let a = scheduler.find_component(root, "a").unwrap();
    let at = scheduler.request_expiration(Priority::Interactive);
    scheduler.update_component(a, at, "first");
    scheduler.update_component(a, at, "second");
    scheduler.flush_work().unwrap();
    assert_eq!(host.commits(), vec!["a", "second"]);
}

#[test]
fn completion_callbacks_fire_once_in_time_order() {
    let (host, mut scheduler, log) = setup();
    let root = scheduler.create_fiber_root("main".to_string());
    scheduler.mount(root, slow("a", &host, 0.0, &log), ExpirationTime::SYNC);
    scheduler.flush_work().unwrap();

    let early = scheduler.request_expiration(Priority::Interactive);
    let late = scheduler.request_expiration(Priority::Async);
    assert!(early < late);

    let fired: Log = Log::default();
    for (time, label) in [(late, "late"), (early, "early")] {
        let fired = fired.clone();
        scheduler.register_completion_callback(root, time, move || fired.borrow_mut().push(label));
    }
    assert_eq!(scheduler.root(root).unwrap().pending_callbacks(), 2);

    scheduler.schedule_work(root, late);
    scheduler.schedule_work(root, early);
    scheduler.flush_work().unwrap();
    assert_eq!(*fired.borrow(), vec!["early", "late"]);

    scheduler.schedule_work(root, ExpirationTime::SYNC);
    scheduler.flush_work().unwrap();
    assert_eq!(fired.borrow().len(), 2);
    assert_eq!(scheduler.root(root).unwrap().pending_callbacks(), 0);

    // Already reached.
    let again = fired.clone();
    scheduler.register_completion_callback(root, early, move || again.borrow_mut().push("now"));
    assert_eq!(*fired.borrow(), vec!["early", "late", "now"]);
}

#[test]
fn completed_at_is_monotonic() {
    let (host, mut scheduler, log) = setup();
    let root = scheduler.create_fiber_root("main".to_string());
    let late = scheduler.request_expiration(Priority::Async);
    scheduler.mount(root, slow("a", &host, 0.0, &log), late);
    scheduler.flush_work().unwrap();
    assert_eq!(scheduler.root(root).unwrap().completed_at, late);

    scheduler.schedule_work(root, ExpirationTime::SYNC);
    scheduler.flush_work().unwrap();
    assert_eq!(host.commits().len(), 2);
    assert_eq!(scheduler.root(root).unwrap().completed_at, late);
}

#[test]
fn unmounted_root_ignores_further_calls() {
    let (host, mut scheduler, log) = setup();
    let root = scheduler.create_fiber_root("main".to_string());
    scheduler.mount(root, slow("a", &host, 0.0, &log), ExpirationTime::SYNC);
    scheduler.flush_work().unwrap();
    let a = scheduler.find_component(root, "a").unwrap();

    scheduler.unmount(root);
    assert!(scheduler.root(root).is_none());
    assert!(!scheduler.fibers().contains(a));

    scheduler.schedule_work(root, ExpirationTime::SYNC);
    scheduler.update_component(a, ExpirationTime::SYNC, "late");
    scheduler.force_expire(root, ExpirationTime::SYNC);
    scheduler.register_completion_callback(root, ExpirationTime::SYNC, || panic!("must not fire"));
    assert_eq!(scheduler.flush_work().unwrap(), WorkStatus::Idle);
    assert_eq!(host.commits(), vec!["a"]);
    assert!(!scheduler.is_root_blocked(root, ExpirationTime::NEVER));
}

#[test]
fn pending_context_swaps_in_at_commit() {
    let (host, mut scheduler, log) = setup();
    let root = scheduler.create_fiber_root("main".to_string());
    scheduler.mount(root, slow("a", &host, 0.0, &log), ExpirationTime::SYNC);
    scheduler.set_pending_context(root, Rc::new(String::from("theme:dark")));
    assert!(scheduler.root(root).unwrap().context.is_none());

    scheduler.flush_work().unwrap();
    let context = scheduler.root(root).unwrap().context.clone().unwrap();
    assert_eq!(
        context.downcast_ref::<String>().map(String::as_str),
        Some("theme:dark")
    );
}

#[test]
fn too_many_passes_in_one_turn_overflow() {
    init_tracing();
    let host = TestHost::new();
    let config = SchedulerConfig {
        nested_update_limit: 1,
        ..SchedulerConfig::default()
    };
    let mut scheduler = WorkScheduler::with_config(host.clone(), config);
    for container in ["one", "two"] {
        let root = scheduler.create_fiber_root(container.to_string());
        scheduler.mount(root, Element::text(container), ExpirationTime::SYNC);
    }

    let error = scheduler.perform_work().unwrap_err();
    assert_eq!(error, SchedulerError::SchedulingOverflow { passes: 1 });
    assert!(error.is_fatal());
    assert_eq!(host.commits(), vec!["one"]);
}

#[test]
fn config_from_json_drives_frame_budget() {
    init_tracing();
    let config = SchedulerConfig::from_json(r#"{ "frame_budget_ms": 100.0 }"#).unwrap();
    assert_eq!(config.nested_update_limit, 1000);

    let host = TestHost::new();
    let log = Log::default();
    let mut scheduler = WorkScheduler::with_config(host.clone(), config);
    let root = scheduler.create_fiber_root("main".to_string());
    let children = ["a", "b", "c", "d"]
        .into_iter()
        .map(|name| slow(name, &host, 3.0, &log))
        .collect();
    let at = scheduler.request_expiration(Priority::Async);
    scheduler.mount(root, Element::host("ul", children), at);

    assert_eq!(scheduler.perform_work().unwrap(), WorkStatus::Idle);
    assert_eq!(scheduler.profiling.yields, 0);

    assert!(SchedulerConfig::from_json(r#"{ "frame_budget_ms": 0 }"#).is_err());
}
