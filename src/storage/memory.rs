use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{build_timer, watches, Storage};
use crate::execution::Execution;
use crate::hooker::Trap;
use crate::types::{Message, Timer, Trace};

struct Queued {
    message: Message,
    loaded: bool,
}

impl Queued {
    fn new(message: Message) -> Self {
        Self { message, loaded: false }
    }
}

#[derive(Default)]
struct State {
    /// Stored messages in enqueue order
    messages: Vec<Queued>,
    timers: Vec<Timer>,
    traps: Vec<Trap>,
    executions: HashMap<String, Execution>,
    traces: Vec<Trace>,
}

/// In-process storage for tests and transient runs
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory storage lock poisoned"))
    }

    /// Messages still waiting, for inspection in tests
    pub fn pending_messages(&self) -> Vec<Message> {
        self.state()
            .map(|s| {
                s.messages
                    .iter()
                    .filter(|q| !q.loaded)
                    .map(|q| q.message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn identity(&self) -> String {
        "memory".to_string()
    }

    async fn put_message(&self, message: &Message) -> Result<()> {
        self.state()?.messages.push(Queued::new(message.clone()));
        Ok(())
    }

    async fn fetch_messages(&self, exid: &str) -> Result<Vec<Message>> {
        let mut state = self.state()?;
        let mut taken = Vec::new();
        for queued in state.messages.iter_mut() {
            if queued.message.exid == exid && !queued.loaded {
                queued.loaded = true;
                taken.push(queued.message.clone());
            }
        }
        Ok(taken)
    }

    async fn consume_messages(&self, exid: &str) -> Result<()> {
        self.state()?
            .messages
            .retain(|q| !(q.loaded && q.message.exid == exid));
        Ok(())
    }

    async fn release_messages(&self, exid: &str) -> Result<()> {
        let mut state = self.state()?;
        for queued in state.messages.iter_mut() {
            if queued.message.exid == exid {
                queued.loaded = false;
            }
        }
        Ok(())
    }

    async fn load_exids(&self) -> Result<Vec<String>> {
        let state = self.state()?;
        let mut exids: Vec<String> = Vec::new();
        for queued in state.messages.iter().filter(|q| !q.loaded) {
            if !exids.contains(&queued.message.exid) {
                exids.push(queued.message.exid.clone());
            }
        }
        Ok(exids)
    }

    async fn load_timers(&self) -> Result<Vec<Timer>> {
        let mut timers = self.state()?.timers.clone();
        timers.sort_by_key(|t| t.ntime);
        Ok(timers)
    }

    async fn put_timer(&self, message: &Message) -> Result<Timer> {
        let timer = build_timer(message)?;
        self.state()?.timers.push(timer.clone());
        Ok(timer)
    }

    async fn trigger_timer(&self, timer: &Timer) -> Result<Option<Timer>> {
        let mut state = self.state()?;
        let Some(index) = state.timers.iter().position(|t| t.id == timer.id) else {
            return Ok(None);
        };

        state.messages.push(Queued::new(timer.message.clone()));

        if !timer.schedule.is_recurring() {
            state.timers.remove(index);
            return Ok(None);
        }

        let stored = &mut state.timers[index];
        stored.count += 1;
        stored.ntime = timer
            .schedule
            .next_time(Utc::now())
            .ok_or_else(|| anyhow!("cannot read schedule {:?}", timer.schedule))?;
        Ok(Some(stored.clone()))
    }

    async fn remove_timers(&self, exid: &str, nid: &str) -> Result<()> {
        self.state()?
            .timers
            .retain(|t| !(t.exid == exid && t.nid == nid));
        Ok(())
    }

    async fn put_trap(&self, _nid: &str, trap: &Trap) -> Result<()> {
        let mut state = self.state()?;
        match state.traps.iter().position(|t| t.id == trap.id) {
            Some(index) => state.traps[index] = trap.clone(),
            None => state.traps.push(trap.clone()),
        }
        Ok(())
    }

    async fn load_traps(&self, exid: &str) -> Result<Vec<Trap>> {
        let state = self.state()?;
        let mut traps: Vec<Trap> = state.traps.iter().filter(|t| watches(t, exid)).cloned().collect();
        traps.sort_by_key(|t| t.created_at);
        Ok(traps)
    }

    async fn remove_traps(&self, exid: &str, bnid: &str) -> Result<()> {
        self.state()?
            .traps
            .retain(|t| !(t.exid == exid && t.bnid == bnid));
        Ok(())
    }

    async fn remove_trap(&self, id: Uuid) -> Result<()> {
        self.state()?.traps.retain(|t| t.id != id);
        Ok(())
    }

    async fn load_execution(&self, exid: &str) -> Result<Option<Execution>> {
        Ok(self.state()?.executions.get(exid).cloned())
    }

    async fn put_execution(&self, execution: &Execution) -> Result<()> {
        self.state()?
            .executions
            .insert(execution.exid.clone(), execution.clone());
        Ok(())
    }

    async fn put_trace(&self, trace: &Trace) -> Result<()> {
        self.state()?.traces.push(trace.clone());
        Ok(())
    }

    async fn load_traces(&self, exid: &str) -> Result<Vec<Trace>> {
        Ok(self
            .state()?
            .traces
            .iter()
            .filter(|t| t.exid == exid)
            .cloned()
            .collect())
    }

    async fn db_version(&self) -> Result<Option<i64>> {
        Ok(None)
    }

    fn migration_version(&self) -> Option<i64> {
        None
    }

    async fn migrate(&self) -> Result<()> {
        Ok(())
    }
}
