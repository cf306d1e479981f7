//! Fixtures shared by the unit test suites

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::execution::Execution;
use crate::executor::Interpreter;
use crate::hooker::{Hooker, Trap};
use crate::loader::MemoryLoader;
use crate::procedures::Registry;
use crate::scheduler::Scheduler;
use crate::storage::{MemoryStorage, Storage};
use crate::tree::Tree;
use crate::types::{Message, Point, Timer, Trace};

pub const EXID: &str = "test-u0-20261017.0930.kabugawa";

pub fn tree(value: JsonValue) -> Tree {
    serde_json::from_value(value).expect("test tree")
}

/// Execute message for the root, vars set up the way `launch` does
pub fn launch_message(exid: &str, flow: JsonValue) -> Message {
    Message::new(Point::Execute, exid, "0")
        .with_tree(tree(flow))
        .with_vars(Map::new())
}

pub fn interpreter() -> Interpreter {
    interpreter_with(Registry::default())
}

pub fn interpreter_with(registry: Registry) -> Interpreter {
    Interpreter::new(Execution::new(EXID), Vec::new(), Arc::new(registry), Arc::new(Hooker::new()))
}

/// Everything a [`drive`] run went through
#[derive(Debug, Default)]
pub struct Run {
    /// Processed messages, in processing order
    pub processed: Vec<Message>,
    /// `schedule` messages handed out as timers
    pub timers: Vec<Message>,
    pub traces: Vec<Trace>,
    /// Messages addressed to other executions
    pub outbound: Vec<Message>,
}

impl Run {
    pub fn points(&self) -> Vec<(Point, String)> {
        self.processed.iter().map(|m| (m.point, m.nid.clone())).collect()
    }

    pub fn last(&self) -> &Message {
        self.processed.last().expect("at least one processed message")
    }

    pub fn find(&self, point: Point, nid: &str) -> Option<&Message> {
        self.processed.iter().find(|m| m.point == point && m.nid == nid)
    }

    pub fn terminated(&self) -> Option<&Message> {
        self.processed.iter().find(|m| m.point == Point::Terminated)
    }
}

/// Processes `message` and everything it leads to, like one executor run
pub fn drive(interpreter: &mut Interpreter, message: Message) -> Run {
    let mut run = Run::default();
    let mut queue = VecDeque::from([message]);

    while let Some(message) = queue.pop_front() {
        assert!(run.processed.len() < 10_000, "runaway execution");

        let effects = interpreter.process(message.clone());
        run.processed.push(message);
        run.timers.extend(effects.timers);
        run.traces.extend(effects.traces);

        for m in effects.messages {
            if m.exid == interpreter.exid() {
                queue.push_back(m);
            } else {
                run.outbound.push(m);
            }
        }
    }

    run
}

/// Fires the wake-up message carried by a timer
pub fn fire(interpreter: &mut Interpreter, timer: &Message) -> Run {
    let inner = timer.message.as_deref().cloned().expect("timer message");
    drive(interpreter, inner)
}

pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        heart_rate_ms: 10,
        reload_frequency_secs: 0,
        max_executors: 4,
        wait_timeout_secs: Some(10),
        ..SchedulerConfig::default()
    }
}

pub fn memory_scheduler(config: SchedulerConfig) -> (Scheduler, Arc<MemoryStorage>) {
    memory_scheduler_with(config, MemoryLoader::new())
}

pub fn memory_scheduler_with(config: SchedulerConfig, loader: MemoryLoader) -> (Scheduler, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let scheduler = Scheduler::builder()
        .config(config)
        .storage(storage.clone())
        .loader(Arc::new(loader))
        .build()
        .expect("scheduler");
    (scheduler, storage)
}

/// Memory storage whose first `n` trace writes fail
pub struct FlakyTraces {
    pub inner: MemoryStorage,
    failures: AtomicUsize,
}

impl FlakyTraces {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: MemoryStorage::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl Storage for FlakyTraces {
    fn identity(&self) -> String {
        "flaky".to_string()
    }
    async fn put_message(&self, message: &Message) -> Result<()> {
        self.inner.put_message(message).await
    }
    async fn fetch_messages(&self, exid: &str) -> Result<Vec<Message>> {
        self.inner.fetch_messages(exid).await
    }
    async fn consume_messages(&self, exid: &str) -> Result<()> {
        self.inner.consume_messages(exid).await
    }
    async fn release_messages(&self, exid: &str) -> Result<()> {
        self.inner.release_messages(exid).await
    }
    async fn load_exids(&self) -> Result<Vec<String>> {
        self.inner.load_exids().await
    }
    async fn load_timers(&self) -> Result<Vec<Timer>> {
        self.inner.load_timers().await
    }
    async fn put_timer(&self, message: &Message) -> Result<Timer> {
        self.inner.put_timer(message).await
    }
    async fn trigger_timer(&self, timer: &Timer) -> Result<Option<Timer>> {
        self.inner.trigger_timer(timer).await
    }
    async fn remove_timers(&self, exid: &str, nid: &str) -> Result<()> {
        self.inner.remove_timers(exid, nid).await
    }
    async fn put_trap(&self, nid: &str, trap: &Trap) -> Result<()> {
        self.inner.put_trap(nid, trap).await
    }
    async fn load_traps(&self, exid: &str) -> Result<Vec<Trap>> {
        self.inner.load_traps(exid).await
    }
    async fn remove_traps(&self, exid: &str, bnid: &str) -> Result<()> {
        self.inner.remove_traps(exid, bnid).await
    }
    async fn remove_trap(&self, id: Uuid) -> Result<()> {
        self.inner.remove_trap(id).await
    }
    async fn load_execution(&self, exid: &str) -> Result<Option<Execution>> {
        self.inner.load_execution(exid).await
    }
    async fn put_execution(&self, execution: &Execution) -> Result<()> {
        self.inner.put_execution(execution).await
    }
    async fn put_trace(&self, trace: &Trace) -> Result<()> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            bail!("trace table unavailable");
        }
        self.inner.put_trace(trace).await
    }
    async fn load_traces(&self, exid: &str) -> Result<Vec<Trace>> {
        self.inner.load_traces(exid).await
    }
    async fn db_version(&self) -> Result<Option<i64>> {
        self.inner.db_version().await
    }
    fn migration_version(&self) -> Option<i64> {
        self.inner.migration_version()
    }
    async fn migrate(&self) -> Result<()> {
        self.inner.migrate().await
    }
}

pub fn flaky_scheduler(config: SchedulerConfig, failures: usize) -> (Scheduler, Arc<FlakyTraces>) {
    let storage = Arc::new(FlakyTraces::new(failures));
    let scheduler = Scheduler::builder()
        .config(config)
        .storage(storage.clone())
        .build()
        .expect("scheduler");
    (scheduler, storage)
}
