//! Procedures: how a node reacts to the messages addressed to it
//!
//! The executor builds a [`Ctx`] for every message it applies and hands it
//! to the node's [`Procedure`]. Procedures never touch storage: timers,
//! traps, traces and node removals are collected in the [`Outbox`] and
//! flushed by the executor once the procedure returns.
//!
//! The default phases walk a node's children in order: attributes first
//! (collected into `atts`), then the body, then a reply to the parent.

mod atoms;
mod break_continue;
mod cancel;
mod cursor;
mod define;
mod fail;
mod sequence;
mod set;
mod sleep;
mod stall;
mod trace;
mod trap;

pub use define::function_application;

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ErrorInfo, PROCEDURE_ERROR};
use crate::execution::{Execution, NodeState};
use crate::hooker::Trap;
use crate::ids;
use crate::node::{DynamicScope, Node};
use crate::payload::Payload;
use crate::tree::Tree;
use crate::types::{Message, Point, Trace};

/* ===================== Outbox ===================== */

/// Side effects requested while applying one message
#[derive(Debug, Default)]
pub struct Outbox {
    pub traps: Vec<Trap>,
    pub traces: Vec<Trace>,
    /// Nodes that replied and must leave the node map
    pub removed: Vec<String>,
}

/* ===================== Context ===================== */

pub struct Ctx<'a> {
    pub execution: &'a mut Execution,
    pub message: &'a Message,
    pub registry: &'a Registry,
    pub outbox: &'a mut Outbox,
    pub nid: String,
    /// Outgoing payload, starts as the message's
    pub payload: Payload,
}

impl<'a> Ctx<'a> {
    pub fn new(
        execution: &'a mut Execution,
        message: &'a Message,
        registry: &'a Registry,
        outbox: &'a mut Outbox,
        nid: impl Into<String>,
    ) -> Self {
        Self {
            payload: message.payload.clone(),
            execution,
            message,
            registry,
            outbox,
            nid: nid.into(),
        }
    }

    pub fn node(&self) -> Result<&NodeState> {
        self.execution
            .node(&self.nid)
            .with_context(|| format!("node {} not found", self.nid))
    }

    pub fn node_mut(&mut self) -> Result<&mut NodeState> {
        let nid = &self.nid;
        self.execution
            .nodes
            .get_mut(nid)
            .with_context(|| format!("node {} not found", nid))
    }

    /// Read view of this node
    pub fn view(&self) -> Node<'_> {
        Node::new(&*self.execution, self.nid.clone(), Some(self.message)).with_scope(self.registry)
    }

    pub fn tree(&self) -> Result<Tree> {
        self.execution
            .lookup_tree(&self.nid)
            .cloned()
            .with_context(|| format!("no tree at {}", self.nid))
    }

    pub fn heap(&self) -> Result<String> {
        Ok(self.node()?.heap.clone().unwrap_or_default())
    }

    /// Starts the child at `index`
    pub fn execute_child(&mut self, index: usize) -> Result<Vec<Message>> {
        let cnid = ids::child_nid(&self.nid, index);
        self.node_mut()?.cnodes.push(cnid.clone());

        let message = Message::new(Point::Execute, self.execution.exid.clone(), cnid)
            .from_nid(self.nid.clone())
            .with_payload(self.payload.clone());
        Ok(vec![message])
    }

    /// Cancel message for `nid`, sent by this node
    pub fn cancel_message(&self, nid: impl Into<String>, flavour: impl Into<String>) -> Message {
        Message::new(Point::Cancel, self.execution.exid.clone(), nid)
            .from_nid(self.nid.clone())
            .with_flavour(flavour)
    }

    /// Replies to the parent and schedules this node for removal
    ///
    /// The root's reply terminates the execution; detached nodes reply to
    /// nobody.
    pub fn reply(&mut self) -> Result<Vec<Message>> {
        let node = self.node()?;
        let payload = match (&node.cancelling, &node.adopted) {
            (Some(_), Some(adopted)) => adopted.clone(),
            _ => self.payload.clone(),
        };
        let parent = node.parent.clone();
        let detached = node.detached;

        if !self.outbox.removed.contains(&self.nid) {
            self.outbox.removed.push(self.nid.clone());
        }

        let exid = self.execution.exid.clone();
        let message = match parent {
            _ if detached => return Ok(Vec::new()),
            Some(parent) => Message::new(Point::Receive, exid, parent),
            None => Message::new(Point::Terminated, exid, self.nid.clone()),
        };

        Ok(vec![message.from_nid(self.nid.clone()).with_payload(payload)])
    }

    pub fn fail(&self, kind: &str, text: impl Into<String>) -> Vec<Message> {
        let line = self.execution.lookup_tree(&self.nid).map(|t| t.line);
        let error = ErrorInfo::new(kind, text).at(self.nid.clone(), line);

        vec![Message::new(Point::Failed, self.execution.exid.clone(), self.nid.clone())
            .from_nid(self.nid.clone())
            .with_payload(self.payload.clone())
            .with_error(error)]
    }

    /// Live children whose cancel should follow this node's
    pub fn cancel_children(&mut self, flavour: &str) -> Result<Vec<Message>> {
        let cnodes = self.node()?.cnodes.clone();
        Ok(cnodes
            .into_iter()
            .map(|c| self.cancel_message(c, flavour))
            .collect())
    }
}

/* ===================== Procedure ===================== */

pub trait Procedure: Send + Sync {
    /// Whether `_att` children are evaluated before the body
    fn evaluates_atts(&self) -> bool {
        true
    }

    /// Loop procedures are the default targets of `break` and `continue`
    fn is_loop(&self) -> bool {
        false
    }

    fn pre_execute(&self, _ctx: &mut Ctx) -> Result<()> {
        Ok(())
    }

    fn execute(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        step(self, ctx, None)
    }

    /// Called once all attributes are in; `ncid` is the first body child
    fn receive_last_att(&self, ctx: &mut Ctx, ncid: usize) -> Result<Vec<Message>> {
        self.receive_non_att(ctx, ncid)
    }

    /// Called when the body child before `ncid` replied
    fn receive_non_att(&self, ctx: &mut Ctx, ncid: usize) -> Result<Vec<Message>> {
        let len = ctx.tree()?.nodes().len();
        if ncid < len {
            ctx.execute_child(ncid)
        } else {
            self.receive_last(ctx)
        }
    }

    fn receive_last(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        ctx.reply()
    }

    /// Reply from something that is not a structural child
    fn receive_other(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        ctx.reply()
    }

    /// Message from the node itself, a timer firing
    fn wake(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        ctx.reply()
    }

    fn receive_when_cancelling(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        finish_cancel(ctx)
    }

    /// The node's `cancelling` flavour is already set
    fn cancel(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        let flavour = ctx.node()?.cancelling.clone().unwrap_or_default();

        if flavour == "kill" {
            let mut out = ctx.cancel_children("kill")?;
            out.extend(ctx.reply()?);
            return Ok(out);
        }

        if ctx.node()?.cnodes.is_empty() {
            return self.receive_when_cancelling(ctx);
        }
        ctx.cancel_children("cancel")
    }

    /// A trap bound to this node caught a message
    fn trigger(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        ctx.reply()
    }
}

/// Entry point for `execute` messages
pub fn execute(proc: &dyn Procedure, ctx: &mut Ctx) -> Result<Vec<Message>> {
    proc.pre_execute(ctx)?;
    proc.execute(ctx)
}

/// Entry point for `receive` messages
pub fn receive(proc: &dyn Procedure, ctx: &mut Ctx) -> Result<Vec<Message>> {
    let from = ctx.message.from.clone();

    if from.as_deref() == Some(ctx.nid.as_str()) {
        return proc.wake(ctx);
    }
    if let Some(from) = &from {
        ctx.node_mut()?.cnodes.retain(|c| c != from);
    }
    if ctx.node()?.cancelling.is_some() {
        return proc.receive_when_cancelling(ctx);
    }

    let Some(from) = from.filter(|f| ids::parent_id(f).as_deref() == Some(ctx.nid.as_str())) else {
        return proc.receive_other(ctx);
    };

    let fcid = ids::child_id(&from);
    let tree = ctx.tree()?;
    let mut out = Vec::new();

    if proc.evaluates_atts() {
        if let Some(att) = tree.nodes().get(fcid).filter(|c| c.is_att()) {
            out.extend(collect_att(ctx, att)?);
        }
    }

    out.extend(step(proc, ctx, Some(fcid))?);
    Ok(out)
}

fn step<P: Procedure + ?Sized>(proc: &P, ctx: &mut Ctx, fcid: Option<usize>) -> Result<Vec<Message>> {
    let tree = ctx.tree()?;
    let ncid = fcid.map_or(0, |i| i + 1);
    let body_start = tree.body_start();

    if !proc.evaluates_atts() {
        return proc.receive_non_att(ctx, ncid.max(body_start));
    }
    if tree.nodes().get(ncid).is_some_and(Tree::is_att) {
        return ctx.execute_child(ncid);
    }
    if ncid == body_start {
        return proc.receive_last_att(ctx, ncid);
    }
    proc.receive_non_att(ctx, ncid)
}

/// Files the value of an attribute child that just replied
fn collect_att(ctx: &mut Ctx, att: &Tree) -> Result<Vec<Message>> {
    let value = ctx.payload.ret().cloned().unwrap_or(JsonValue::Null);
    let key = att.att_key().map(str::to_string);
    let mut out = Vec::new();

    let node = ctx.node_mut()?;
    let entry_ret = node.payload.ret().cloned();

    match key.as_deref() {
        Some("tag" | "tags") => {
            let tags: Vec<String> = match &value {
                JsonValue::String(s) => vec![s.clone()],
                JsonValue::Array(a) => a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
                _ => Vec::new(),
            };
            if !tags.is_empty() {
                node.tags.extend(tags.iter().cloned());
                let mut entered = Message::new(Point::Entered, ctx.execution.exid.clone(), ctx.nid.clone())
                    .with_payload(ctx.payload.clone());
                entered.tags = tags;
                out.push(entered);
            }
        }
        Some("on_error") => node.on_error.push(value),
        _ => node.atts.push((key, value)),
    }

    match entry_ret {
        Some(ret) => ctx.payload.set_ret(ret),
        None => {
            ctx.payload.remove("ret");
        }
    }

    Ok(out)
}

/// Default end of a cancel: reply once every child is gone
///
/// A node cancelled for its `on_error` handler runs the handler instead.
pub fn finish_cancel(ctx: &mut Ctx) -> Result<Vec<Message>> {
    let node = ctx.node()?;
    if !node.cnodes.is_empty() {
        return Ok(Vec::new());
    }
    if node.cancelling.as_deref() != Some("on_error") {
        return ctx.reply();
    }

    let handler = node.on_error.first().cloned().unwrap_or(JsonValue::Null);
    let error = node.error.clone();
    {
        let node = ctx.node_mut()?;
        node.cancelling = Some("on_error_run".to_string());
        node.on_error.clear();
        node.adopted = None;
    }

    let error_value = serde_json::to_value(&error).context("Failed to serialize error")?;
    ctx.payload.insert("error", error_value.clone());

    if define::is_func(&handler) {
        let mut keyed = serde_json::Map::new();
        keyed.insert("err".to_string(), error_value.clone());
        let message = function_application(ctx.execution, &handler, vec![error_value], keyed)?
            .from_nid(ctx.nid.clone())
            .with_payload(ctx.payload.clone());
        ctx.node_mut()?.cnodes.push(message.nid.clone());
        return Ok(vec![message]);
    }

    ctx.payload.set_ret(handler);
    ctx.reply()
}

/* ===================== Registry ===================== */

/// Synchronous task handler, bound as `["_task", name, -1]`
pub type TaskHandler = dyn Fn(&str, &[(Option<String>, JsonValue)], &Payload) -> Result<JsonValue> + Send + Sync;

/// Point → procedure table plus task handlers
pub struct Registry {
    procedures: HashMap<String, Arc<dyn Procedure>>,
    tasks: HashMap<String, Arc<TaskHandler>>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            procedures: HashMap::new(),
            tasks: HashMap::new(),
        }
    }

    pub fn register(&mut self, names: &[&str], procedure: Arc<dyn Procedure>) {
        for name in names {
            self.procedures.insert(name.to_string(), procedure.clone());
        }
    }

    pub fn register_task<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&str, &[(Option<String>, JsonValue)], &Payload) -> Result<JsonValue> + Send + Sync + 'static,
    {
        self.tasks.insert(name.to_string(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Procedure>> {
        self.procedures.get(name).cloned()
    }

    pub fn task(&self, name: &str) -> Option<Arc<TaskHandler>> {
        self.tasks.get(name).cloned()
    }

    pub fn is_loop(&self, heap: &str) -> bool {
        self.procedures.get(heap).is_some_and(|p| p.is_loop())
    }
}

impl Default for Registry {
    fn default() -> Self {
        let mut r = Self::empty();

        r.register(&["sequence"], Arc::new(sequence::Sequence));
        r.register(&["_fun"], Arc::new(sequence::FunctionBody));
        r.register(&["concurrence"], Arc::new(sequence::Concurrence));
        r.register(&["cursor"], Arc::new(cursor::Cursor { restart_at_end: false }));
        r.register(&["loop"], Arc::new(cursor::Cursor { restart_at_end: true }));
        r.register(&["stall"], Arc::new(stall::Stall));
        r.register(&["sleep"], Arc::new(sleep::Sleep));
        r.register(&["trap"], Arc::new(trap::TrapProc));
        r.register(&["break", "continue"], Arc::new(break_continue::Break));
        r.register(&["cancel", "kill"], Arc::new(cancel::Cancel));
        r.register(&["fail", "error"], Arc::new(fail::Fail));
        r.register(&["trace"], Arc::new(trace::TraceProc));
        r.register(&["define", "def", "fun"], Arc::new(define::Define));
        r.register(&["_apply"], Arc::new(define::Apply));
        r.register(&["set"], Arc::new(set::Set));
        r.register(&["_att"], Arc::new(atoms::Att));
        r.register(&["_sqs", "_num", "_boo", "_nul"], Arc::new(atoms::Atom));
        r.register(&["_dqs"], Arc::new(atoms::DoubleQuoted));
        r.register(&["_arr"], Arc::new(atoms::Array));
        r.register(&["_ref"], Arc::new(atoms::Reference));
        r.register(&["_task"], Arc::new(atoms::Task));

        r
    }
}

impl DynamicScope for Registry {
    fn has_procedure(&self, name: &str) -> bool {
        self.procedures.contains_key(name)
    }

    fn has_task(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }
}

/// `["_proc", name, -1]` / `["_task", name, -1]` → `name`
pub(crate) fn tagged_name<'v>(value: &'v JsonValue, tag: &str) -> Option<&'v str> {
    match value.as_array().map(Vec::as_slice) {
        Some([JsonValue::String(t), JsonValue::String(name), _]) if t == tag => Some(name),
        _ => None,
    }
}

/// Resolves what drives the node at `nid`: `(heap, heat)`
///
/// Returns None when the head cannot be applied.
pub fn resolve_head(execution: &Execution, registry: &Registry, nid: &str, message: &Message) -> Result<Option<(String, JsonValue)>> {
    let Some(tree) = execution.lookup_tree(nid) else {
        return Ok(None);
    };
    let view = Node::new(execution, nid, Some(message)).with_scope(registry);
    let Some(value) = view.lookup(&tree.name)? else {
        return Ok(None);
    };

    if let Some(name) = tagged_name(&value, "_proc") {
        return Ok(Some((name.to_string(), value.clone())));
    }
    if tagged_name(&value, "_task").is_some() {
        return Ok(Some(("_task".to_string(), value)));
    }
    if define::is_func(&value) {
        return Ok(Some(("_apply".to_string(), value)));
    }
    if tree.is_leaf() {
        return Ok(Some(("_ref".to_string(), value)));
    }
    Ok(None)
}

/// Failure message for a head that resolves to nothing callable
pub fn cannot_apply(execution: &Execution, nid: &str, payload: &Payload) -> Message {
    let tree = execution.lookup_tree(nid);
    let name = tree.map(|t| t.name.clone()).unwrap_or_default();
    let error = ErrorInfo::new(PROCEDURE_ERROR, format!("don't know how to apply {:?}", name))
        .at(nid, tree.map(|t| t.line));

    Message::new(Point::Failed, execution.exid.clone(), nid)
        .from_nid(nid)
        .with_payload(payload.clone())
        .with_error(error)
}

pub(crate) fn json_string_list(value: &JsonValue) -> Option<Vec<String>> {
    match value {
        JsonValue::String(s) => Some(vec![s.clone()]),
        JsonValue::Array(a) => a.iter().map(|v| v.as_str().map(str::to_string)).collect(),
        _ => None,
    }
}
