//! Synchronous message interpreter for one execution
//!
//! Applies messages to the node map and reports everything that must leave
//! the process (storage writes, messages for other executions, timers) as
//! [`Effects`]. The async [`super::Executor`] persists those; tests drive
//! the interpreter directly.

use anyhow::{Context, Result};
use serde_json::Map;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ErrorInfo, PROCEDURE_ERROR};
use crate::execution::{Execution, NodeState};
use crate::hooker::{Hooker, Trap};
use crate::procedures::{self, cannot_apply, function_application, Ctx, Outbox, Procedure, Registry};
use crate::types::{ExecutionStatus, Message, Point, Trace};

/// What processing one message asks of the outside world
#[derive(Debug, Default)]
pub struct Effects {
    /// Follow-up messages, for this execution or others
    pub messages: Vec<Message>,
    /// `schedule` messages to turn into timers
    pub timers: Vec<Message>,
    /// New traps and traps whose count changed
    pub traps: Vec<Trap>,
    pub spent_traps: Vec<Uuid>,
    pub traces: Vec<Trace>,
    /// Nodes that replied, in removal order
    pub removed: Vec<NodeState>,
}

pub struct Interpreter {
    pub execution: Execution,
    pub traps: Vec<Trap>,
    registry: Arc<Registry>,
    hooker: Arc<Hooker>,
}

impl Interpreter {
    pub fn new(execution: Execution, traps: Vec<Trap>, registry: Arc<Registry>, hooker: Arc<Hooker>) -> Self {
        Self {
            execution,
            traps,
            registry,
            hooker,
        }
    }

    pub fn exid(&self) -> &str {
        &self.execution.exid
    }

    /// Applies one message, never fails: procedure errors become `failed`
    /// messages for the node that raised them
    pub fn process(&mut self, mut message: Message) -> Effects {
        let mut effects = Effects::default();
        self.execution.counters.msgs += 1;

        debug!(exid = %message.exid, "{}", message.summary());

        effects
            .messages
            .extend(self.hooker.notify(Some(&self.execution), &self.traps, &message));

        let mut outbox = Outbox::default();

        match self.apply(&message, &mut outbox, &mut effects) {
            Ok(messages) => effects.messages.extend(messages),
            Err(e) => {
                warn!(
                    exid = %message.exid,
                    nid = %message.nid,
                    point = %message.point,
                    "Procedure failed: {:#}",
                    e
                );
                let line = self.execution.lookup_tree(&message.nid).map(|t| t.line);
                let error = ErrorInfo::new(PROCEDURE_ERROR, format!("{:#}", e)).at(message.nid.clone(), line);
                effects.messages.push(
                    Message::new(Point::Failed, message.exid.clone(), message.nid.clone())
                        .from_nid(message.nid.clone())
                        .with_payload(message.payload.clone())
                        .with_error(error),
                );
            }
        }

        self.flush(outbox, &mut effects);

        message.consumed = true;
        if let Some(journal) = self.execution.journal.as_mut() {
            journal.push(message.clone());
        }

        effects
            .messages
            .extend(self.hooker.notify(Some(&self.execution), &self.traps, &message));

        effects
    }

    fn procedure_at(&self, nid: &str) -> Result<Arc<dyn Procedure>> {
        let heap = self
            .execution
            .node(nid)
            .and_then(|n| n.heap.clone())
            .unwrap_or_default();
        self.registry
            .get(&heap)
            .with_context(|| format!("no procedure {:?} at {}", heap, nid))
    }

    fn apply(&mut self, message: &Message, outbox: &mut Outbox, effects: &mut Effects) -> Result<Vec<Message>> {
        match message.point {
            Point::Execute => self.apply_execute(message, outbox),
            Point::Receive => {
                if self.execution.node(&message.nid).is_none() {
                    return Ok(Vec::new());
                }
                let procedure = self.procedure_at(&message.nid)?;
                let mut ctx = Ctx::new(&mut self.execution, message, &self.registry, outbox, message.nid.clone());
                procedures::receive(procedure.as_ref(), &mut ctx)
            }
            Point::Cancel => self.apply_cancel(message, outbox),
            Point::Trigger => self.apply_trigger(message, outbox, effects),
            Point::Schedule => {
                let readable = message
                    .schedule
                    .as_ref()
                    .and_then(|s| s.next_time(chrono::Utc::now()))
                    .is_some();
                if !readable || message.message.is_none() {
                    let error = ErrorInfo::new(PROCEDURE_ERROR, "cannot read schedule").at(message.nid.clone(), None);
                    return Ok(vec![Message::new(Point::Failed, message.exid.clone(), message.nid.clone())
                        .from_nid(message.nid.clone())
                        .with_payload(message.payload.clone())
                        .with_error(error)]);
                }
                effects.timers.push(message.clone());
                Ok(Vec::new())
            }
            Point::Terminated => {
                self.execution.status = ExecutionStatus::Terminated;
                Ok(Vec::new())
            }
            Point::Failed => Ok(self.apply_failed(message)),
            Point::Signal | Point::Entered | Point::Left => Ok(Vec::new()),
        }
    }

    fn apply_execute(&mut self, message: &Message, outbox: &mut Outbox) -> Result<Vec<Message>> {
        let nid = message.nid.clone();
        let parent = message.from.clone();

        let mut node = NodeState::new(nid.clone(), parent.clone());
        node.tree = message.tree.clone();
        node.vars = message.vars.clone();
        node.cnid = message.cnid.clone();
        node.detached = parent.is_none() && nid != "0";
        node.payload = message.payload.clone();

        if nid == "0" && message.journal && self.execution.journal.is_none() {
            self.execution.journal = Some(Vec::new());
        }
        self.execution.nodes.insert(nid.clone(), node);

        let head = procedures::resolve_head(&self.execution, &self.registry, &nid, message)?;
        let Some((heap, heat)) = head else {
            return Ok(vec![cannot_apply(&self.execution, &nid, &message.payload)]);
        };
        let Some(procedure) = self.registry.get(&heap) else {
            return Ok(vec![cannot_apply(&self.execution, &nid, &message.payload)]);
        };

        let heat0 = self.execution.lookup_tree(&nid).map(|t| t.name.clone());
        if let Some(node) = self.execution.node_mut(&nid) {
            node.heap = Some(heap);
            node.heat = Some(heat);
            node.heat0 = heat0;
        }

        let mut ctx = Ctx::new(&mut self.execution, message, &self.registry, outbox, nid);
        procedures::execute(procedure.as_ref(), &mut ctx)
    }

    fn apply_cancel(&mut self, message: &Message, outbox: &mut Outbox) -> Result<Vec<Message>> {
        let flavour = message.flavour.clone().unwrap_or_else(|| "cancel".to_string());

        let Some(node) = self.execution.node_mut(&message.nid) else {
            return Ok(Vec::new());
        };
        if node.cancelling.is_some() && flavour != "kill" {
            return Ok(Vec::new());
        }

        node.cancelling = Some(flavour);
        if !message.payload.is_empty() {
            node.adopted = Some(message.payload.clone());
        }
        let entry_payload = node.payload.clone();

        let procedure = self.procedure_at(&message.nid)?;
        let mut ctx = Ctx::new(&mut self.execution, message, &self.registry, outbox, message.nid.clone());
        ctx.payload = entry_payload;
        procedure.cancel(&mut ctx)
    }

    fn apply_trigger(&mut self, message: &Message, outbox: &mut Outbox, effects: &mut Effects) -> Result<Vec<Message>> {
        let Some(index) = message
            .trap_id
            .and_then(|id| self.traps.iter().position(|t| t.id == id))
        else {
            return Ok(Vec::new());
        };

        let trap = match self.traps[index].count {
            Some(c) if c <= 1 => {
                let trap = self.traps.remove(index);
                effects.spent_traps.push(trap.id);
                trap
            }
            Some(c) => {
                self.traps[index].count = Some(c - 1);
                effects.traps.push(self.traps[index].clone());
                self.traps[index].clone()
            }
            None => self.traps[index].clone(),
        };

        if let Some(handler) = &trap.handler {
            let caught = message.message.as_deref();
            let caught_value = caught
                .map(serde_json::to_value)
                .transpose()
                .context("Failed to serialize trapped message")?
                .unwrap_or_default();

            let mut keyed = Map::new();
            keyed.insert("msg".to_string(), caught_value.clone());
            let payload = caught.map(|m| m.payload.clone()).unwrap_or_default();

            let run = function_application(&mut self.execution, handler, vec![caught_value], keyed)?.with_payload(payload);
            return Ok(vec![run]);
        }

        if self.execution.node(&trap.nid).is_none() {
            return Ok(Vec::new());
        }
        let procedure = self.procedure_at(&trap.nid)?;
        let mut ctx = Ctx::new(&mut self.execution, message, &self.registry, outbox, trap.nid.clone());
        procedure.trigger(&mut ctx)
    }

    /// Hands the error to the nearest `on_error`, else fails the execution
    fn apply_failed(&mut self, message: &Message) -> Vec<Message> {
        let mut seen = HashSet::new();
        let mut current = Some(message.nid.clone());

        while let Some(nid) = current {
            if !seen.insert(nid.clone()) {
                break;
            }
            let Some(node) = self.execution.node_mut(&nid) else {
                break;
            };
            let handling = matches!(node.cancelling.as_deref(), Some("on_error" | "on_error_run"));
            if !node.on_error.is_empty() && !handling {
                node.error = message.error.clone();
                return vec![Message::new(Point::Cancel, message.exid.clone(), nid)
                    .from_nid(message.nid.clone())
                    .with_flavour("on_error")];
            }
            current = node.parent.clone();
        }

        warn!(
            exid = %message.exid,
            nid = %message.nid,
            "Execution failed: {}",
            message.error.as_ref().map(|e| e.message.as_str()).unwrap_or("-")
        );
        self.execution.status = ExecutionStatus::Failed;
        self.execution.error = message.error.clone();
        Vec::new()
    }

    fn flush(&mut self, outbox: Outbox, effects: &mut Effects) {
        for trap in outbox.traps {
            self.traps.push(trap.clone());
            effects.traps.push(trap);
        }
        effects.traces.extend(outbox.traces);

        for nid in outbox.removed {
            let Some(node) = self.execution.nodes.remove(&nid) else {
                continue;
            };
            if !node.tags.is_empty() {
                let mut left = Message::new(Point::Left, self.execution.exid.clone(), nid.clone())
                    .with_payload(node.payload.clone());
                left.tags = node.tags.clone();
                effects.messages.push(left);
            }
            self.traps.retain(|t| t.bnid != nid);
            effects.removed.push(node);
        }
    }
}
