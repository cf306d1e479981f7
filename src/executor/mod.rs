//! Executor: the per-exid message loop
//!
//! At most one executor runs per exid at any time (the scheduler enforces
//! it), so the node map needs no locking. An executor drains the pending
//! messages of its execution in enqueue order, persists the effects of each
//! one, and saves the execution after every batch.
//!
//! A batch is only consumed once the execution is saved. When anything in
//! between fails, the batch is released and the next run replays it from
//! the last saved execution, so effects persisted before the failure may be
//! written twice.

mod interpreter;

pub use interpreter::{Effects, Interpreter};

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

use crate::execution::Execution;
use crate::scheduler::Scheduler;
use crate::types::Message;

pub struct Executor {
    exid: String,
    scheduler: Scheduler,
}

impl Executor {
    pub fn new(scheduler: Scheduler, exid: impl Into<String>) -> Self {
        Self {
            exid: exid.into(),
            scheduler,
        }
    }

    pub fn exid(&self) -> &str {
        &self.exid
    }

    pub async fn run(self) -> Result<()> {
        let storage = self.scheduler.storage();

        let execution = storage
            .load_execution(&self.exid)
            .await
            .context("Failed to load execution")?
            .unwrap_or_else(|| Execution::new(self.exid.clone()));
        let traps = storage
            .load_traps(&self.exid)
            .await
            .context("Failed to load traps")?;

        let mut interpreter = Interpreter::new(execution, traps, self.scheduler.registry(), self.scheduler.hooker());
        interpreter.execution.counters.runs += 1;

        debug!(exid = %self.exid, run = interpreter.execution.counters.runs, "Executor started");

        loop {
            let batch = storage
                .fetch_messages(&self.exid)
                .await
                .context("Failed to fetch messages")?;
            if batch.is_empty() {
                break;
            }

            if let Err(e) = self.run_batch(&mut interpreter, batch).await {
                self.release().await;
                return Err(e);
            }

            storage
                .consume_messages(&self.exid)
                .await
                .context("Failed to consume messages")?;
        }

        if interpreter.execution.status.is_over() {
            info!(
                exid = %self.exid,
                status = ?interpreter.execution.status,
                msgs = interpreter.execution.counters.msgs,
                "Execution over"
            );
        }

        Ok(())
    }

    /// Processes `batch` and whatever it produces for this exid, then saves
    async fn run_batch(&self, interpreter: &mut Interpreter, batch: Vec<Message>) -> Result<()> {
        let mut queue: VecDeque<Message> = batch.into();

        while let Some(message) = queue.pop_front() {
            let effects = interpreter.process(message);
            self.persist(interpreter, effects, &mut queue).await?;
        }

        interpreter.execution.updated_at = Utc::now();
        self.scheduler
            .storage()
            .put_execution(&interpreter.execution)
            .await
            .context("Failed to save execution")
    }

    async fn persist(&self, interpreter: &mut Interpreter, effects: Effects, queue: &mut VecDeque<Message>) -> Result<()> {
        let storage = self.scheduler.storage();

        for trap in &effects.traps {
            storage
                .put_trap(&trap.nid, trap)
                .await
                .context("Failed to save trap")?;
        }
        for id in effects.spent_traps {
            storage.remove_trap(id).await.context("Failed to remove trap")?;
        }
        for trace in &effects.traces {
            storage.put_trace(trace).await.context("Failed to save trace")?;
        }

        for node in effects.removed {
            storage
                .remove_timers(&self.exid, &node.nid)
                .await
                .context("Failed to remove timers")?;
            storage
                .remove_traps(&self.exid, &node.nid)
                .await
                .context("Failed to remove traps")?;
            self.scheduler.remove_node(&self.exid, node);
        }

        for message in &effects.timers {
            let timer = storage.put_timer(message).await.context("Failed to save timer")?;
            self.scheduler.add_timer(timer);
        }

        for message in effects.messages {
            if message.exid == self.exid {
                queue.push_back(message);
                continue;
            }
            interpreter.execution.counters.omsgs += 1;
            let exid = message.exid.clone();
            storage
                .put_message(&message)
                .await
                .context("Failed to queue message")?;
            self.scheduler.wake_up_executions(vec![exid]);
        }

        Ok(())
    }

    /// Hands the loaded batch back so the next run replays it
    async fn release(&self) {
        match self.scheduler.storage().release_messages(&self.exid).await {
            Ok(()) => {
                warn!(exid = %self.exid, "Released unsaved batch");
                self.scheduler.wake_up_executions(vec![self.exid.clone()]);
            }
            Err(e) => error!(exid = %self.exid, "Failed to release messages: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests;
