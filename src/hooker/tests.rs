use super::*;
use crate::execution::{Execution, NodeState};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

const EXID: &str = "org.acme-u0-20261016.1200.hooktest";

fn msg(point: Point, nid: &str) -> Message {
    Message::new(point, EXID, nid)
}

fn counting(opts: HookOptions) -> (Arc<AtomicUsize>, Arc<dyn Observer>) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let observer = FunctionObserver::from_fn(opts, move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        JsonValue::Null
    });
    (count, Arc::new(observer))
}

fn execution() -> Execution {
    let mut ex = Execution::new(EXID);
    let mut node = NodeState::new("0_1", Some("0".into()));
    node.heap = Some("sequence".into());
    node.heat0 = Some("seq".into());
    ex.nodes.insert("0_1".into(), node);
    ex
}

#[test]
fn test_point_and_name_filters() {
    let hooker = Hooker::new();
    let (count, observer) = counting(HookOptions::new().points([Point::Left]).names(&["foo"]));
    hooker.add(Some("h"), observer);

    hooker.notify(None, &[], &msg(Point::Left, "0").with_name("bar"));
    assert_eq!(count.load(Ordering::SeqCst), 0);

    hooker.notify(None, &[], &msg(Point::Left, "0").with_name("foo"));
    assert_eq!(count.load(Ordering::SeqCst), 1);

    hooker.notify(None, &[], &msg(Point::Entered, "0").with_name("foo"));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_consumed_filter() {
    let ctx = HookContext::new(None);
    let mut m = msg(Point::Execute, "0");

    assert!(matches(&HookOptions::new().consumed(false), None, &ctx, &m));
    assert!(!matches(&HookOptions::new().consumed(true), None, &ctx, &m));
    m.consumed = true;
    assert!(matches(&HookOptions::new().consumed(true), None, &ctx, &m));
    assert!(matches(&HookOptions::new(), None, &ctx, &m));
}

#[test]
fn test_exid_and_domain_filters() {
    let ctx = HookContext::new(None);
    let m = msg(Point::Execute, "0");

    assert!(matches(&HookOptions::new().exid(EXID), None, &ctx, &m));
    assert!(!matches(&HookOptions::new().exid("other"), None, &ctx, &m));
    assert!(matches(&HookOptions::new().domains(&["org.acme"]), None, &ctx, &m));
    assert!(matches(&HookOptions::new().domains(&["/^org\\./"]), None, &ctx, &m));
    assert!(!matches(&HookOptions::new().domains(&["org"]), None, &ctx, &m));
    assert!(matches(&HookOptions::new().subdomains(&["org"]), None, &ctx, &m));
    assert!(!matches(&HookOptions::new().subdomains(&["com"]), None, &ctx, &m));
}

#[test]
fn test_tag_filter_only_on_entered_and_left() {
    let ctx = HookContext::new(None);
    let opts = HookOptions::new().tags(&["blue"]);

    let mut entered = msg(Point::Entered, "0_1");
    entered.tags = vec!["red".into(), "blue".into()];
    assert!(matches(&opts, None, &ctx, &entered));

    let mut execute = msg(Point::Execute, "0_1");
    execute.tags = vec!["blue".into()];
    assert!(!matches(&opts, None, &ctx, &execute));

    let mut left = msg(Point::Left, "0_1");
    left.tags = vec!["green".into()];
    assert!(!matches(&opts, None, &ctx, &left));
}

#[test]
fn test_heap_and_heat_filters_need_a_live_node() {
    let ex = execution();
    let ctx = HookContext::new(Some(&ex));

    assert!(matches(&HookOptions::new().heaps(&["sequence"]), None, &ctx, &msg(Point::Receive, "0_1")));
    assert!(!matches(&HookOptions::new().heaps(&["cursor"]), None, &ctx, &msg(Point::Receive, "0_1")));
    assert!(matches(&HookOptions::new().heats(&["seq"]), None, &ctx, &msg(Point::Receive, "0_1")));
    assert!(!matches(&HookOptions::new().heaps(&["sequence"]), None, &ctx, &msg(Point::Receive, "0_9")));
}

#[test]
fn test_trap_self_exclusion() {
    let ctx = HookContext::new(None);
    let trap = Trap::new(EXID, "0_1", "0", HookOptions::new().points([Point::Receive, Point::Trigger]));

    // from inside the trap's subtree
    let inner = msg(Point::Receive, "0_1").from_nid("0_1_0");
    assert!(!trap.matches(&ctx, &inner));

    // handler runs count as inside
    let handler = msg(Point::Receive, "0").from_nid("0_1-3");
    assert!(!trap.matches(&ctx, &handler));

    let outer = msg(Point::Receive, "0").from_nid("0_2");
    assert!(trap.matches(&ctx, &outer));

    // never its own trigger
    assert!(!trap.matches(&ctx, &trap.trigger_message(&outer)));

    let mut opts = trap.opts.clone();
    opts.include_self = true;
    assert!(matches(&opts, Some(&trap), &ctx, &inner));
}

#[test]
fn test_trap_subnid() {
    let ex = execution();
    let ctx = HookContext::new(Some(&ex));

    let mut opts = HookOptions::new();
    opts.subnid = true;

    let bound = Trap::new(EXID, "0_5", "0_1", opts.clone());
    assert!(bound.matches(&ctx, &msg(Point::Receive, "0_1")));
    assert!(!bound.matches(&ctx, &msg(Point::Receive, "0_9")));

    let rooted = Trap::new(EXID, "0_5", "0", opts);
    assert!(rooted.matches(&ctx, &msg(Point::Receive, "0_9")));
}

#[test]
fn test_trap_handle_emits_trigger() {
    let hooker = Hooker::new();
    let trap = Trap::new(EXID, "0_1", "0_1", HookOptions::new().points([Point::Signal]));

    let signal = msg(Point::Signal, "0").with_name("go");
    let out = hooker.notify(None, std::slice::from_ref(&trap), &signal);

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].point, Point::Trigger);
    assert_eq!(out[0].nid, "0_1");
    assert_eq!(out[0].trap_id, Some(trap.id));
    assert_eq!(out[0].message.as_deref(), Some(&signal));
}

#[test]
fn test_function_observer_return_values_are_lenient() {
    let hooker = Hooker::new();

    hooker.add(None, Arc::new(FunctionObserver::from_fn(HookOptions::new(), |_| json!("nope"))));
    hooker.add(None, Arc::new(FunctionObserver::from_fn(HookOptions::new(), |_| json!([1, 2]))));
    hooker.add(None, Arc::new(FunctionObserver::from_fn(HookOptions::new(), |_| json!([{"bad": true}]))));
    hooker.add(
        None,
        Arc::new(FunctionObserver::new(
            HookOptions::new(),
            Callback::WithOptions(Box::new(|m: &Message, _opts: &HookOptions| {
                json!([{"point": "signal", "exid": m.exid, "nid": "0", "name": "echo"}])
            })),
        )),
    );

    let out = hooker.notify(None, &[], &msg(Point::Execute, "0"));
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].name.as_deref(), Some("echo"));
}

#[test]
fn test_failing_observers_are_swallowed() {
    struct Faulty(HookOptions);

    impl Observer for Faulty {
        fn options(&self) -> &HookOptions {
            &self.0
        }

        fn handle(&self, _ctx: &HookContext<'_>, _message: &Message) -> Result<Vec<Message>> {
            anyhow::bail!("faulty observer")
        }
    }

    let hooker = Hooker::new();
    hooker.add(Some("faulty"), Arc::new(Faulty(HookOptions::new())));
    hooker.add(
        Some("panicky"),
        Arc::new(FunctionObserver::from_fn(HookOptions::new(), |_| panic!("boom"))),
    );
    let (count, observer) = counting(HookOptions::new());
    hooker.add(Some("counter"), observer);

    let out = hooker.notify(None, &[], &msg(Point::Execute, "0"));
    assert!(out.is_empty());
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(hooker.get("counter").is_some());
}

#[test]
fn test_done_waiters_are_dropped() {
    let hooker = Hooker::new();
    let (list, _rx) = WaitList::new(EXID, WaitSpec::terminated());
    hooker.add(Some("wait"), Arc::new(list));
    assert_eq!(hooker.len(), 1);

    let mut term = msg(Point::Terminated, "0");
    term.consumed = true;
    hooker.notify(None, &[], &term);

    assert!(hooker.is_empty());
}

#[test]
fn test_registration_survives_a_poisoned_lock() {
    let hooker = Arc::new(Hooker::new());
    let h = hooker.clone();
    let _ = std::thread::spawn(move || {
        let _guard = h.hooks.write().unwrap();
        panic!("poison");
    })
    .join();
    assert!(hooker.hooks.is_poisoned());

    let (count, observer) = counting(HookOptions::new());
    hooker.add(Some("counter"), observer);
    assert_eq!(hooker.len(), 1);

    hooker.notify(None, &[], &msg(Point::Execute, "0"));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}
