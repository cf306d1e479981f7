pub mod cli;
pub mod config;
pub mod db;
pub mod deep;
pub mod error;
pub mod execution;
pub mod executor;
pub mod hooker;
pub mod ids;
pub mod loader;
pub mod node;
pub mod payload;
pub mod procedures;
pub mod schedule;
pub mod scheduler;
pub mod storage;
pub mod tree;
pub mod types;

#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export main types
pub use error::{EngineError, ErrorInfo};
pub use execution::{Execution, NodeState};
pub use payload::Payload;
pub use scheduler::{LaunchOptions, Launched, MessageRequest, Scheduler, SchedulerBuilder};
pub use tree::Tree;
pub use types::*;
