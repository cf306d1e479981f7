use super::*;
use crate::execution::{Execution, NodeState};
use crate::payload::Payload;
use crate::types::Point;
use maplit::hashset;
use serde_json::{json, Map};
use std::collections::HashSet;

struct Procs(HashSet<&'static str>);

impl DynamicScope for Procs {
    fn has_procedure(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    fn has_task(&self, name: &str) -> bool {
        name == "alice"
    }
}

fn vars(v: JsonValue) -> Option<Map<String, JsonValue>> {
    v.as_object().cloned()
}

fn node(nid: &str, parent: Option<&str>, v: Option<JsonValue>) -> NodeState {
    let mut n = NodeState::new(nid, parent.map(str::to_string));
    n.vars = v.and_then(vars);
    n
}

/// 0 {x: 1, y: 0}
///   0_1 {x: 5}
///     0_1_0 (no vars)
///       0_1_0_0 (no vars)
fn execution() -> Execution {
    let mut ex = Execution::new("test-u0-20261016.1200.nodetest");
    for n in [
        node("0", None, Some(json!({"x": 1, "y": 0}))),
        node("0_1", Some("0"), Some(json!({"x": 5}))),
        node("0_1_0", Some("0_1"), None),
        node("0_1_0_0", Some("0_1_0"), None),
    ] {
        ex.nodes.insert(n.nid.clone(), n);
    }
    ex
}

#[test]
fn test_key_split() {
    assert_eq!(key_split("x"), (Category::Var, Mode::Nearest, "x".into()));
    assert_eq!(key_split("v.x"), (Category::Var, Mode::Nearest, "x".into()));
    assert_eq!(key_split("gv.x.y"), (Category::Var, Mode::Global, "x.y".into()));
    assert_eq!(key_split("lvar.x"), (Category::Var, Mode::Local, "x".into()));
    assert_eq!(key_split("dvariable.x"), (Category::Var, Mode::Dynamic, "x".into()));
    assert_eq!(key_split("f.ret"), (Category::Field, Mode::Nearest, "ret".into()));
    assert_eq!(key_split("field.a.b"), (Category::Field, Mode::Nearest, "a.b".into()));
    assert_eq!(key_split("g.x"), (Category::Var, Mode::Global, "x".into()));
    assert_eq!(key_split("l.x.y"), (Category::Var, Mode::Local, "x.y".into()));
    assert_eq!(key_split("d.cancel"), (Category::Var, Mode::Dynamic, "cancel".into()));
    assert_eq!(key_split("x.y"), (Category::Var, Mode::Nearest, "x.y".into()));
    assert_eq!(key_split(".x"), (Category::Var, Mode::Nearest, ".x".into()));
    // lenient: not a mode prefix
    assert_eq!(key_split("zv.x"), (Category::Var, Mode::Nearest, "zv.x".into()));
}

#[test]
fn test_lookup_climbs_to_parent_scope() {
    let ex = execution();
    let n = Node::new(&ex, "0_1_0_0", None);

    assert_eq!(n.lookup("v.x").unwrap(), Some(json!(5)));
    assert_eq!(n.lookup("y").unwrap(), Some(json!(0)));
    assert_eq!(n.lookup("nada").unwrap(), None);
}

#[test]
fn test_global_lookup_skips_shadowing() {
    let ex = execution();
    let n = Node::new(&ex, "0_1_0", None);

    assert_eq!(n.lookup("gv.x").unwrap(), Some(json!(1)));
    assert_eq!(n.lookup("g.x").unwrap(), Some(json!(1)));
    assert_eq!(n.lookup("x").unwrap(), Some(json!(5)));
}

#[test]
fn test_global_lookup_on_rootless_node_fails() {
    let mut ex = execution();
    ex.node_mut("0").unwrap().vars = None;
    let n = Node::new(&ex, "0_1_0", None);

    let err = n.lookup("g.x").unwrap_err();
    assert!(err.to_string().contains("node 0 has no vars and no parent"));
}

#[test]
fn test_local_lookup_stops_at_nearest_scope() {
    let ex = execution();
    let n = Node::new(&ex, "0_1_0_0", None);

    assert_eq!(n.lookup("l.x").unwrap(), Some(json!(5)));
    assert_eq!(n.lookup("l.y").unwrap(), None);
}

#[test]
fn test_closure_vars_shadow_structural_parent() {
    let mut ex = execution();
    ex.nodes.insert("0_2".into(), node("0_2", Some("0"), Some(json!({"x": 7, "z": 8}))));
    ex.node_mut("0_1_0").unwrap().cnid = Some("0_2".into());

    let n = Node::new(&ex, "0_1_0_0", None);
    assert_eq!(n.lookup("x").unwrap(), Some(json!(7)));
    assert_eq!(n.lookup("z").unwrap(), Some(json!(8)));
    // closure miss falls back to the structural chain
    assert_eq!(n.lookup("y").unwrap(), Some(json!(0)));
}

#[test]
fn test_dynamic_lookup() {
    let ex = execution();
    let procs = Procs(hashset! {"sequence", "cancel"});
    let n = Node::new(&ex, "0_1_0", None).with_scope(&procs);

    assert_eq!(n.lookup("sequence").unwrap(), Some(json!(["_proc", "sequence", -1])));
    assert_eq!(n.lookup("d.cancel").unwrap(), Some(json!(["_proc", "cancel", -1])));
    assert_eq!(n.lookup("alice").unwrap(), Some(json!(["_task", "alice", -1])));
    assert_eq!(n.lookup("d.x").unwrap(), None);
    assert_eq!(n.lookup("bob").unwrap(), None);
}

#[test]
fn test_field_lookup() {
    let ex = execution();
    let mut msg = Message::new(Point::Receive, ex.exid.clone(), "0_1_0");
    msg.payload = Payload::from_value(json!({"ret": [1, {"a": "b"}], "k": "v"}));

    let n = Node::new(&ex, "0_1_0", Some(&msg));
    assert_eq!(n.lookup("f.k").unwrap(), Some(json!("v")));
    assert_eq!(n.lookup("f.ret.last.a").unwrap(), Some(json!("b")));
    assert_eq!(n.lookup("f.ret.7").unwrap(), None);
    assert_eq!(n.lookup("f.nada").unwrap(), None);
}

#[test]
fn test_deref_and_fei() {
    let ex = execution();
    let n = Node::new(&ex, "0_1", None);

    assert_eq!(n.deref(&json!("x")).unwrap(), Some(json!(5)));
    assert_eq!(n.deref(&json!(3)).unwrap(), Some(json!(3)));
    assert_eq!(n.fei(), "test-u0-20261016.1200.nodetest-0_1");
    assert_eq!(n.parent(), Some("0"));
}

#[test]
fn test_expand() {
    let ex = execution();
    let mut msg = Message::new(Point::Receive, ex.exid.clone(), "0_1_0");
    msg.payload = Payload::from_value(json!({"key": "x", "list": [1, 2]}));
    let n = Node::new(&ex, "0_1_0", Some(&msg));

    assert_eq!(n.expand("x is $(x)").unwrap(), json!("x is 5"));
    assert_eq!(n.expand("$(x)").unwrap(), json!(5));
    assert_eq!(n.expand("$(f.list)").unwrap(), json!([1, 2]));
    assert_eq!(n.expand("at $(nid)").unwrap(), json!("at 0_1_0"));
    assert_eq!(n.expand("$(exid)").unwrap(), json!(ex.exid.clone()));
    assert_eq!(n.expand("$(v.$(f.key))").unwrap(), json!(5));
    assert_eq!(n.expand("$(nada||'none)").unwrap(), json!("none"));
    assert_eq!(n.expand("[$(nada)]").unwrap(), json!("[]"));
    assert_eq!(n.expand("no placeholder").unwrap(), json!("no placeholder"));
    assert_eq!(n.expand("$(unclosed").unwrap(), json!("$(unclosed"));
    assert!(n.expand("$(tstamp)").unwrap().as_str().unwrap().ends_with('Z'));
}
