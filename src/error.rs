//! Engine error taxonomy
//!
//! Only invariant violations live here: caller or configuration bugs that
//! must never be silently absorbed. Errors raised by a flow itself are not
//! Rust errors, they travel as `failed` messages carrying an [`ErrorInfo`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid domain name {0:?}")]
    InvalidDomain(String),

    #[error("missing :{0} key")]
    MissingField(&'static str),

    #[error("flow not found in {0:?}")]
    FlowNotFound(String),

    #[error("flow parse failure: {0}")]
    ParseFailure(String),

    #[error("node {0} has no vars and no parent")]
    Rootless(String),

    #[error("don't know how to apply {0:?}")]
    CannotApply(String),

    #[error("database not ready, db ver: {db_version:?}, mig ver: {migration_version:?}")]
    DatabaseNotReady {
        db_version: Option<i64>,
        migration_version: Option<i64>,
    },

    #[error("scheduler is shut down")]
    SchedulerShutdown,

    #[error("timed out waiting on execution {exid}")]
    WaitTimeout { exid: String },
}

/// Error descriptor carried by `failed` messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    #[serde(rename = "msg")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            nid: None,
            line: None,
        }
    }

    pub fn at(mut self, nid: impl Into<String>, line: Option<usize>) -> Self {
        self.nid = Some(nid.into());
        self.line = line;
        self
    }
}

/* ===================== Error Kinds ===================== */

/// Raised explicitly by `fail` / `error`
pub const FLOW_ERROR: &str = "FlowError";

/// Raised when a procedure rejects its input or state
pub const PROCEDURE_ERROR: &str = "ProcedureError";
