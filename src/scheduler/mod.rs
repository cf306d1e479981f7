//! Scheduler: heartbeat loop, timers and the executor pool
//!
//! The heartbeat ticks every `heart_rate`. Each tick reloads timers and
//! pending exids from storage when the reload interval elapsed, fires the
//! due timers, then starts executors for pending exids, never more than
//! `max_executors` at once and never two for the same exid.
//!
//! # Example
//!
//! ```rust,ignore
//! let scheduler = Scheduler::builder()
//!     .storage(Arc::new(MemoryStorage::new()))
//!     .build()?;
//! scheduler.start().await?;
//!
//! let launched = scheduler
//!     .launch(r#"["sequence", [], 1]"#, LaunchOptions::new().wait(WaitSpec::terminated()))
//!     .await?;
//! ```

mod launch;

pub use launch::{LaunchOptions, Launched, MessageRequest};

use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::EngineError;
use crate::execution::{Execution, NodeState};
use crate::executor::Executor;
use crate::hooker::{FunctionObserver, HookOptions, Hooker, LogHook, Observer, Trap, WaitList, WaitSpec};
use crate::loader::{FlowParser, JsonTreeParser, Loader, MemoryLoader};
use crate::procedures::Registry;
use crate::storage::{MemoryStorage, Storage};
use crate::types::{Message, Timer};

/// Heartbeat states; `Shutdown` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Running,
    Stop,
    Shutdown,
}

#[derive(Default)]
struct State {
    /// Sorted by `ntime`
    timers: Vec<Timer>,
    /// Exids with pending messages, oldest first
    exids: Vec<String>,
    reloaded_at: Option<Instant>,
}

type Archive = HashMap<String, HashMap<String, NodeState>>;

struct Inner {
    config: SchedulerConfig,
    identifier: String,
    storage: Arc<dyn Storage>,
    loader: Arc<dyn Loader>,
    parser: Arc<dyn FlowParser>,
    registry: Arc<Registry>,
    hooker: Arc<Hooker>,
    state: Mutex<State>,
    executors: Mutex<HashMap<String, JoinHandle<()>>>,
    archive: Mutex<Option<Archive>>,
    status: watch::Sender<Status>,
    cancel: CancellationToken,
    heart: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheap handle, clones share the same scheduler
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/* ===================== Builder ===================== */

pub struct SchedulerBuilder {
    config: SchedulerConfig,
    storage: Option<Arc<dyn Storage>>,
    loader: Option<Arc<dyn Loader>>,
    parser: Option<Arc<dyn FlowParser>>,
    registry: Option<Registry>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
            storage: None,
            loader: None,
            parser: None,
            registry: None,
        }
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn parser(mut self, parser: Arc<dyn FlowParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        self.config.validate()?;

        let hooker = Arc::new(Hooker::new());
        hooker.add(Some("logger"), Arc::new(LogHook::new()));

        let (status, _) = watch::channel(Status::Idle);

        let inner = Inner {
            identifier: identifier(),
            config: self.config,
            storage: self.storage.unwrap_or_else(|| Arc::new(MemoryStorage::new())),
            loader: self.loader.unwrap_or_else(|| Arc::new(MemoryLoader::new())),
            parser: self.parser.unwrap_or_else(|| Arc::new(JsonTreeParser)),
            registry: Arc::new(self.registry.unwrap_or_default()),
            hooker,
            state: Mutex::new(State::default()),
            executors: Mutex::new(HashMap::new()),
            archive: Mutex::new(None),
            status,
            cancel: CancellationToken::new(),
            heart: tokio::sync::Mutex::new(None),
        };

        Ok(Scheduler { inner: Arc::new(inner) })
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// `s` + 5 hex chars, distinct per scheduler instance
fn identifier() -> String {
    let seed = format!("{}-{}-{}", std::process::id(), Utc::now().timestamp_nanos_opt().unwrap_or_default(), Uuid::new_v4());
    let digest = Sha256::digest(seed.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("s{}", &hex[..5])
}

/* ===================== Accessors ===================== */

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.inner.storage.clone()
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.inner.registry.clone()
    }

    pub fn hooker(&self) -> Arc<Hooker> {
        self.inner.hooker.clone()
    }

    pub fn status(&self) -> Status {
        *self.inner.status.borrow()
    }

    pub(crate) fn loader(&self) -> &dyn Loader {
        self.inner.loader.as_ref()
    }

    pub(crate) fn parser(&self) -> &dyn FlowParser {
        self.inner.parser.as_ref()
    }
}

/* ===================== Lifecycle ===================== */

impl Scheduler {
    /// Starts (or resumes) the heartbeat
    pub async fn start(&self) -> Result<()> {
        if self.status() == Status::Shutdown {
            return Err(EngineError::SchedulerShutdown.into());
        }

        if self.inner.config.migration_check && !self.inner.storage.ready().await? {
            return Err(EngineError::DatabaseNotReady {
                db_version: self.inner.storage.db_version().await?,
                migration_version: self.inner.storage.migration_version(),
            }
            .into());
        }

        self.inner.status.send_replace(Status::Running);

        let mut heart = self.inner.heart.lock().await;
        if heart.is_none() {
            let scheduler = self.clone();
            *heart = Some(tokio::spawn(async move { scheduler.heartbeat().await }));
        }

        info!(
            scheduler = %self.inner.identifier,
            storage = %self.inner.storage.identity(),
            heart_rate_ms = self.inner.config.heart_rate_ms,
            max_executors = self.inner.config.max_executors,
            "Scheduler started"
        );

        Ok(())
    }

    /// Parks the heartbeat, `start` resumes it
    pub fn stop(&self) {
        if self.status() != Status::Shutdown {
            self.inner.status.send_replace(Status::Stop);
            info!(scheduler = %self.inner.identifier, "Scheduler stopped");
        }
    }

    /// Stops the heartbeat for good and waits for live executors
    pub async fn shutdown(&self) {
        self.inner.status.send_replace(Status::Shutdown);
        self.inner.cancel.cancel();

        self.join().await;

        let handles: Vec<JoinHandle<()>> = lock(&self.inner.executors).drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(scheduler = %self.inner.identifier, "Executor task failed: {}", e);
            }
        }

        self.inner.hooker.shutdown();
        self.inner.storage.shutdown().await;

        info!(scheduler = %self.inner.identifier, "Scheduler shut down");
    }

    /// Waits for the heartbeat task to exit
    pub async fn join(&self) {
        let handle = self.inner.heart.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(scheduler = %self.inner.identifier, "Heartbeat task failed: {}", e);
            }
        }
    }

    async fn heartbeat(&self) {
        let mut status = self.inner.status.subscribe();
        let heart_rate = self.inner.config.heart_rate();

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(heart_rate) => {}
            }

            let current = *status.borrow_and_update();
            match current {
                Status::Shutdown => break,
                Status::Idle | Status::Stop => {
                    tokio::select! {
                        _ = self.inner.cancel.cancelled() => break,
                        _ = status.changed() => {}
                    }
                    continue;
                }
                Status::Running => {}
            }

            match AssertUnwindSafe(self.tick()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    scheduler = %self.inner.identifier,
                    thread = ?std::thread::current().id(),
                    storage = %self.inner.storage.identity(),
                    "Heartbeat tick failed: {:?}",
                    e
                ),
                Err(panic) => error!(
                    scheduler = %self.inner.identifier,
                    thread = ?std::thread::current().id(),
                    storage = %self.inner.storage.identity(),
                    "Heartbeat tick panicked: {}",
                    panic_reason(&panic)
                ),
            }
        }

        debug!(scheduler = %self.inner.identifier, "Heartbeat exited");
    }

    async fn tick(&self) -> Result<()> {
        self.reload().await?;
        self.trigger_timers().await?;
        self.trigger_executions();
        Ok(())
    }
}

fn panic_reason(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/* ===================== Heartbeat Steps ===================== */

impl Scheduler {
    async fn reload(&self) -> Result<()> {
        let due = lock(&self.inner.state)
            .reloaded_at
            .map_or(true, |at| at.elapsed() >= self.inner.config.reload_frequency());
        if !due {
            return Ok(());
        }

        let mut timers = self.inner.storage.load_timers().await?;
        let exids = self.inner.storage.load_exids().await?;
        timers.sort_by_key(|t| t.ntime);

        let mut state = lock(&self.inner.state);
        state.timers = timers;
        state.exids = exids;
        state.reloaded_at = Some(Instant::now());

        Ok(())
    }

    async fn trigger_timers(&self) -> Result<()> {
        let now = Utc::now();
        let due: Vec<Timer> = {
            let mut state = lock(&self.inner.state);
            let count = state.timers.iter().take_while(|t| t.ntime <= now).count();
            state.timers.drain(..count).collect()
        };
        if due.is_empty() {
            return Ok(());
        }

        let mut rescheduled = Vec::new();
        let mut exids = Vec::new();
        let mut pending = due.into_iter();

        while let Some(timer) = pending.next() {
            match self.inner.storage.trigger_timer(&timer).await {
                Ok(next) => {
                    debug!(exid = %timer.exid, nid = %timer.nid, count = timer.count, "Timer fired");
                    exids.push(timer.exid.clone());
                    rescheduled.extend(next);
                }
                Err(e) => {
                    // keep the untriggered ones for the next tick
                    rescheduled.push(timer);
                    rescheduled.extend(pending);
                    self.readmit(rescheduled);
                    self.wake_up_executions(exids);
                    return Err(e);
                }
            }
        }

        self.readmit(rescheduled);
        self.wake_up_executions(exids);

        Ok(())
    }

    fn readmit(&self, timers: Vec<Timer>) {
        if timers.is_empty() {
            return;
        }
        let mut state = lock(&self.inner.state);
        state.timers.extend(timers);
        state.timers.sort_by_key(|t| t.ntime);
    }

    fn trigger_executions(&self) {
        let exids = std::mem::take(&mut lock(&self.inner.state).exids);
        if exids.is_empty() {
            return;
        }

        let max = self.inner.config.max_executors;
        let mut deferred = Vec::new();

        {
            let mut executors = lock(&self.inner.executors);
            executors.retain(|_, handle| !handle.is_finished());

            for exid in exids {
                if executors.contains_key(&exid) || executors.len() >= max {
                    deferred.push(exid);
                    continue;
                }
                let handle = self.spawn_executor(exid.clone());
                executors.insert(exid, handle);
            }
        }

        if !deferred.is_empty() {
            let mut state = lock(&self.inner.state);
            let woken = std::mem::take(&mut state.exids);
            for exid in woken {
                if !deferred.contains(&exid) {
                    deferred.push(exid);
                }
            }
            state.exids = deferred;
        }
    }

    fn spawn_executor(&self, exid: String) -> JoinHandle<()> {
        let executor = Executor::new(self.clone(), exid.clone());
        let scheduler = self.inner.identifier.clone();

        tokio::spawn(async move {
            match AssertUnwindSafe(executor.run()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(scheduler = %scheduler, exid = %exid, "Executor failed: {:?}", e),
                Err(panic) => error!(scheduler = %scheduler, exid = %exid, "Executor panicked: {}", panic_reason(&panic)),
            }
        })
    }
}

/* ===================== Messages & Waiting ===================== */

impl Scheduler {
    /// Enqueues `message`, waiting for `wait` when given
    ///
    /// The waiter is registered before the message is stored, so even a
    /// fast execution cannot finish unseen.
    pub async fn queue(&self, message: Message, wait: Option<WaitSpec>) -> Result<Launched> {
        let exid = message.exid.clone();
        let waiter = wait.map(|spec| self.register_wait(&exid, spec));

        self.inner.storage.put_message(&message).await?;
        self.wake_up_executions(vec![exid.clone()]);

        match waiter {
            Some(rx) => Ok(Launched::Done(self.await_wait(&exid, rx).await?)),
            None => Ok(Launched::Queued(exid)),
        }
    }

    /// Waits until `exid` matches `spec` (or fails)
    pub async fn wait(&self, exid: &str, spec: WaitSpec) -> Result<Message> {
        let rx = self.register_wait(exid, spec);
        self.await_wait(exid, rx).await
    }

    fn register_wait(&self, exid: &str, spec: WaitSpec) -> oneshot::Receiver<Message> {
        let (list, rx) = WaitList::new(exid, spec);
        self.inner.hooker.add(Some("wlist"), Arc::new(list));
        rx
    }

    async fn await_wait(&self, exid: &str, rx: oneshot::Receiver<Message>) -> Result<Message> {
        let received = match self.inner.config.wait_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| EngineError::WaitTimeout { exid: exid.to_string() })?,
            None => rx.await,
        };
        received.map_err(|_| EngineError::SchedulerShutdown.into())
    }

    pub fn hook(&self, name: Option<&str>, observer: Arc<dyn Observer>) {
        self.inner.hooker.add(name, observer);
    }

    /// Registers a closure observer
    pub fn hook_fn<F>(&self, name: Option<&str>, opts: HookOptions, f: F)
    where
        F: Fn(&Message) -> serde_json::Value + Send + Sync + 'static,
    {
        self.hook(name, Arc::new(FunctionObserver::from_fn(opts, f)));
    }

    pub async fn put_timer(&self, message: &Message) -> Result<Timer> {
        let timer = self.inner.storage.put_timer(message).await?;
        self.add_timer(timer.clone());
        Ok(timer)
    }

    pub(crate) fn add_timer(&self, timer: Timer) {
        self.readmit(vec![timer]);
    }

    pub async fn trap(&self, nid: &str, trap: &Trap) -> Result<()> {
        self.inner.storage.put_trap(nid, trap).await
    }

    /// Makes `exids` eligible at the next tick without waiting for a reload
    pub fn wake_up_executions(&self, exids: Vec<String>) {
        if exids.is_empty() {
            return;
        }
        let mut state = lock(&self.inner.state);
        for exid in exids {
            if !state.exids.contains(&exid) {
                state.exids.push(exid);
            }
        }
    }

    /// Forgets the in-memory timers of a removed node and archives it
    pub(crate) fn remove_node(&self, exid: &str, node: NodeState) {
        lock(&self.inner.state)
            .timers
            .retain(|t| !(t.exid == exid && t.nid == node.nid));

        if let Some(archive) = lock(&self.inner.archive).as_mut() {
            archive
                .entry(exid.to_string())
                .or_default()
                .insert(node.nid.clone(), node);
        }
    }

    pub(crate) fn enable_archive(&self) {
        lock(&self.inner.archive).get_or_insert_with(HashMap::new);
    }

    /// Removed nodes of `exid`, when archiving is on
    pub fn archive(&self, exid: &str) -> Option<HashMap<String, NodeState>> {
        lock(&self.inner.archive).as_ref()?.get(exid).cloned()
    }

    pub fn is_executing(&self, exid: &str) -> bool {
        lock(&self.inner.executors)
            .get(exid)
            .is_some_and(|h| !h.is_finished())
    }

    pub fn live_executors(&self) -> usize {
        lock(&self.inner.executors)
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    pub async fn load_execution(&self, exid: &str) -> Result<Option<Execution>> {
        self.inner.storage.load_execution(exid).await
    }
}
