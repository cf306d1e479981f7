//! Hooker: predicate-matching dispatch over the message stream
//!
//! Every message an executor processes is offered twice, before and after
//! it is applied (`consumed` false then true), to the registered hooks and
//! then to the execution's traps. Matching is a single conjunction of
//! filters, cheapest first. Observer failures are logged and swallowed.

mod log;
mod options;
mod trap;
mod wait;

pub use log::LogHook;
pub use options::{DomainPattern, HookOptions};
pub use trap::Trap;
pub use wait::{WaitList, WaitSpec};

use anyhow::Result;
use serde_json::Value as JsonValue;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::error;

use crate::execution::{Execution, NodeState};
use crate::ids;
use crate::types::{Message, Point};

/* ===================== Observer ===================== */

/// What the hooker hands to observers
pub struct HookContext<'a> {
    execution: Option<&'a Execution>,
}

impl<'a> HookContext<'a> {
    pub fn new(execution: Option<&'a Execution>) -> Self {
        Self { execution }
    }

    pub fn execution(&self) -> Option<&'a Execution> {
        self.execution
    }

    pub fn node(&self, nid: &str) -> Option<&'a NodeState> {
        self.execution.and_then(|e| e.node(nid))
    }
}

pub trait Observer: Send + Sync {
    fn options(&self) -> &HookOptions;

    fn matches(&self, ctx: &HookContext<'_>, message: &Message) -> bool {
        matches(self.options(), None, ctx, message)
    }

    /// Follow-up messages to queue
    fn handle(&self, ctx: &HookContext<'_>, message: &Message) -> Result<Vec<Message>>;

    /// Done observers are dropped from the hooker
    fn is_done(&self) -> bool {
        false
    }

    fn shutdown(&self) {}
}

type Callback1 = dyn Fn(&Message) -> JsonValue + Send + Sync;
type Callback2 = dyn Fn(&Message, &HookOptions) -> JsonValue + Send + Sync;
type Callback3 = dyn Fn(&HookContext<'_>, &Message, &HookOptions) -> JsonValue + Send + Sync;

pub enum Callback {
    Message(Box<Callback1>),
    WithOptions(Box<Callback2>),
    WithContext(Box<Callback3>),
}

/// Plain closure observer
///
/// Whatever the closure returns is only taken as follow-up messages when it
/// is an array of objects that all read as messages; anything else counts
/// as no messages.
pub struct FunctionObserver {
    opts: HookOptions,
    callback: Callback,
}

impl FunctionObserver {
    pub fn new(opts: HookOptions, callback: Callback) -> Self {
        Self { opts, callback }
    }

    pub fn from_fn<F>(opts: HookOptions, f: F) -> Self
    where
        F: Fn(&Message) -> JsonValue + Send + Sync + 'static,
    {
        Self::new(opts, Callback::Message(Box::new(f)))
    }
}

fn lenient_messages(value: JsonValue) -> Vec<Message> {
    let JsonValue::Array(items) = value else {
        return Vec::new();
    };
    if !items.iter().all(JsonValue::is_object) {
        return Vec::new();
    }
    items
        .into_iter()
        .map(serde_json::from_value::<Message>)
        .collect::<Result<Vec<_>, _>>()
        .unwrap_or_default()
}

impl Observer for FunctionObserver {
    fn options(&self) -> &HookOptions {
        &self.opts
    }

    fn handle(&self, ctx: &HookContext<'_>, message: &Message) -> Result<Vec<Message>> {
        let value = match &self.callback {
            Callback::Message(f) => f(message),
            Callback::WithOptions(f) => f(message, &self.opts),
            Callback::WithContext(f) => f(ctx, message, &self.opts),
        };
        Ok(lenient_messages(value))
    }
}

/* ===================== Matching ===================== */

/// The filter chain; `trap` adds the trap-only filters
pub fn matches(opts: &HookOptions, trap: Option<&Trap>, ctx: &HookContext<'_>, message: &Message) -> bool {
    if let Some(c) = opts.consumed {
        if c != message.consumed {
            return false;
        }
    }

    if let Some(trap) = trap {
        if message.point == Point::Trigger {
            return false;
        }
        if !opts.include_self && trap.within_itself(message) {
            return false;
        }
    }

    if let Some(points) = &opts.points {
        if !points.contains(&message.point) {
            return false;
        }
    }

    if let Some(exid) = &opts.exid {
        if exid != &message.exid {
            return false;
        }
    }

    let domain = ids::exid_domain(&message.exid);

    if let (Some(domain), Some(domains)) = (domain, &opts.domains) {
        if !domains.iter().any(|d| d.matches(domain)) {
            return false;
        }
    }

    if let (Some(domain), Some(subdomains)) = (domain, &opts.subdomains) {
        if !subdomains.iter().any(|sd| domain.starts_with(sd.as_str())) {
            return false;
        }
    }

    if let Some(tags) = &opts.tags {
        if !matches!(message.point, Point::Entered | Point::Left) {
            return false;
        }
        if !message.tags.iter().any(|t| tags.contains(t)) {
            return false;
        }
    }

    if let Some(names) = &opts.names {
        match &message.name {
            Some(name) if names.contains(name) => {}
            _ => return false,
        }
    }

    // looked up at most once, and only when a filter needs it
    let mut node: Option<Option<&NodeState>> = None;
    let mut live_node = || *node.get_or_insert_with(|| ctx.node(&message.nid));

    if let Some(trap) = trap.filter(|_| opts.subnid) {
        if live_node().is_some() {
            if !ids::is_descendant_of(&message.nid, &trap.bnid, true) {
                return false;
            }
        } else if trap.bnid != "0" {
            return false;
        }
    }

    if let Some(heaps) = &opts.heaps {
        match live_node().and_then(|n| n.heap.as_ref()) {
            Some(heap) if heaps.contains(heap) => {}
            _ => return false,
        }
    }

    if let Some(heats) = &opts.heats {
        match live_node().and_then(|n| n.heat0.as_ref()) {
            Some(heat) if heats.contains(heat) => {}
            _ => return false,
        }
    }

    true
}

/* ===================== Hooker ===================== */

struct Hook {
    name: Option<String>,
    observer: Arc<dyn Observer>,
}

#[derive(Default)]
pub struct Hooker {
    hooks: RwLock<Vec<Hook>>,
}

impl Hooker {
    pub fn new() -> Self {
        Self::default()
    }

    // poisoned locks are recovered
    fn read(&self) -> RwLockReadGuard<'_, Vec<Hook>> {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Hook>> {
        self.hooks.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, name: Option<&str>, observer: Arc<dyn Observer>) {
        self.write().push(Hook {
            name: name.map(str::to_string),
            observer,
        });
    }

    /// First observer registered under `name`
    pub fn get(&self, name: &str) -> Option<Arc<dyn Observer>> {
        self.read()
            .iter()
            .find(|h| h.name.as_deref() == Some(name))
            .map(|h| h.observer.clone())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offers `message` to every hook, then to `traps`, in registration order
    pub fn notify(&self, execution: Option<&Execution>, traps: &[Trap], message: &Message) -> Vec<Message> {
        let ctx = HookContext::new(execution);
        let observers: Vec<(Option<String>, Arc<dyn Observer>)> = self
            .read()
            .iter()
            .map(|h| (h.name.clone(), h.observer.clone()))
            .collect();

        let mut out = Vec::new();

        for (name, observer) in &observers {
            out.extend(Self::run(name.as_deref(), observer.as_ref(), &ctx, message));
        }
        for trap in traps {
            out.extend(Self::run(Some("trap"), trap, &ctx, message));
        }

        if observers.iter().any(|(_, o)| o.is_done()) {
            self.write().retain(|h| !h.observer.is_done());
        }

        out
    }

    fn run(name: Option<&str>, observer: &dyn Observer, ctx: &HookContext<'_>, message: &Message) -> Vec<Message> {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            if observer.matches(ctx, message) {
                observer.handle(ctx, message)
            } else {
                Ok(Vec::new())
            }
        }));

        match outcome {
            Ok(Ok(messages)) => messages,
            Ok(Err(e)) => {
                error!(
                    hook = name.unwrap_or("-"),
                    exid = %message.exid,
                    nid = %message.nid,
                    point = %message.point,
                    "Hook failed: {:?}",
                    e
                );
                Vec::new()
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    hook = name.unwrap_or("-"),
                    exid = %message.exid,
                    nid = %message.nid,
                    point = %message.point,
                    "Hook panicked: {}",
                    reason
                );
                Vec::new()
            }
        }
    }

    pub fn shutdown(&self) {
        let mut hooks = self.write();
        for hook in hooks.iter() {
            hook.observer.shutdown();
        }
        hooks.clear();
    }
}

#[cfg(test)]
mod tests;
