//! Storage: the durable message queue, timer table and execution store
//!
//! The engine never looks at rows, it only goes through [`Storage`].
//! [`MemoryStorage`] keeps everything in process; [`PgStorage`] is the
//! Postgres backend.

mod memory;
mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PgStorage;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::execution::Execution;
use crate::hooker::Trap;
use crate::types::{Message, Timer, Trace};

#[async_trait]
pub trait Storage: Send + Sync {
    /// Short description for logs
    fn identity(&self) -> String;

    async fn put_message(&self, message: &Message) -> Result<()>;

    /// Marks every pending message of `exid` as loaded and returns them,
    /// in enqueue order
    ///
    /// Loaded messages are skipped by later fetches. They stay stored until
    /// consumed or released.
    async fn fetch_messages(&self, exid: &str) -> Result<Vec<Message>>;

    /// Deletes the loaded messages of `exid`
    async fn consume_messages(&self, exid: &str) -> Result<()>;

    /// Turns the loaded messages of `exid` back into pending ones
    async fn release_messages(&self, exid: &str) -> Result<()>;

    /// Exids with pending messages, oldest first
    async fn load_exids(&self) -> Result<Vec<String>>;

    /// Every timer, soonest first
    async fn load_timers(&self) -> Result<Vec<Timer>>;

    /// Stores the timer described by a `schedule` message
    async fn put_timer(&self, message: &Message) -> Result<Timer>;

    /// Queues the timer's message
    ///
    /// Recurring timers are rescheduled and returned; one-shot timers are
    /// deleted. A timer that no longer exists fires nothing.
    async fn trigger_timer(&self, timer: &Timer) -> Result<Option<Timer>>;

    async fn remove_timers(&self, exid: &str, nid: &str) -> Result<()>;

    /// Inserts or updates a trap registered by node `nid`
    async fn put_trap(&self, nid: &str, trap: &Trap) -> Result<()>;

    /// Traps of `exid` plus the traps watching beyond their execution
    async fn load_traps(&self, exid: &str) -> Result<Vec<Trap>>;

    async fn remove_traps(&self, exid: &str, bnid: &str) -> Result<()>;

    async fn remove_trap(&self, id: Uuid) -> Result<()>;

    async fn load_execution(&self, exid: &str) -> Result<Option<Execution>>;

    async fn put_execution(&self, execution: &Execution) -> Result<()>;

    async fn put_trace(&self, trace: &Trace) -> Result<()>;

    async fn load_traces(&self, exid: &str) -> Result<Vec<Trace>>;

    /// Applied schema version, None before the first migration
    async fn db_version(&self) -> Result<Option<i64>>;

    /// Schema version this build expects
    fn migration_version(&self) -> Option<i64>;

    async fn ready(&self) -> Result<bool> {
        Ok(self.db_version().await? == self.migration_version())
    }

    async fn migrate(&self) -> Result<()>;

    async fn shutdown(&self) {}
}

/// Timer for a `schedule` message, first firing computed from now
pub(crate) fn build_timer(message: &Message) -> Result<Timer> {
    let schedule = message
        .schedule
        .clone()
        .ok_or_else(|| anyhow!("schedule message without schedule"))?;
    let inner = message
        .message
        .as_deref()
        .cloned()
        .ok_or_else(|| anyhow!("schedule message without message"))?;
    let ntime = schedule
        .next_time(Utc::now())
        .ok_or_else(|| anyhow!("cannot read schedule {:?}", schedule))?;

    Ok(Timer {
        id: Uuid::new_v4(),
        exid: message.exid.clone(),
        nid: message.nid.clone(),
        schedule,
        ntime,
        count: 0,
        message: inner,
    })
}

/// Traps registered without an exid filter watch other executions too
pub(crate) fn watches(trap: &Trap, exid: &str) -> bool {
    trap.exid == exid || trap.opts.exid.is_none()
}

#[cfg(test)]
mod tests;
