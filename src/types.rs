use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::error::ErrorInfo;
use crate::payload::Payload;
use crate::tree::Tree;

/* ===================== Points ===================== */

/// Message kinds. A reply travels as `receive` addressed to the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Point {
    Execute,
    Receive,
    Cancel,
    Signal,
    Trigger,
    Schedule,
    Entered,
    Left,
    Terminated,
    Failed,
}

impl Point {
    pub fn as_str(&self) -> &'static str {
        match self {
            Point::Execute => "execute",
            Point::Receive => "receive",
            Point::Cancel => "cancel",
            Point::Signal => "signal",
            Point::Trigger => "trigger",
            Point::Schedule => "schedule",
            Point::Entered => "entered",
            Point::Left => "left",
            Point::Terminated => "terminated",
            Point::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Point> {
        serde_json::from_value(JsonValue::String(s.to_string())).ok()
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/* ===================== Schedules ===================== */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "string", rename_all = "lowercase")]
pub enum ScheduleSpec {
    /// One-shot, relative (`"3s"`, `"1m30s"`)
    In(String),
    /// One-shot, absolute RFC 3339 timestamp
    At(String),
    /// Recurring, relative to the previous firing
    Every(String),
}

/* ===================== Messages ===================== */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub point: Point,
    pub exid: String,
    pub nid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(default)]
    pub payload: Payload,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavour: Option<String>,

    /// Materialized tree, carried by root launches, function applications
    /// and trap handler runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<Tree>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<Map<String, JsonValue>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cnid: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub consumed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trap_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleSpec>,

    /// Wrapped message: the one a timer re-injects, or the one a trap caught
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Box<Message>>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub journal: bool,
}

impl Message {
    pub fn new(point: Point, exid: impl Into<String>, nid: impl Into<String>) -> Self {
        Self {
            point,
            exid: exid.into(),
            nid: nid.into(),
            from: None,
            payload: Payload::new(),
            flavour: None,
            tree: None,
            vars: None,
            cnid: None,
            tags: Vec::new(),
            name: None,
            consumed: false,
            error: None,
            trap_id: None,
            schedule: None,
            message: None,
            journal: false,
        }
    }

    pub fn from_nid(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_flavour(mut self, flavour: impl Into<String>) -> Self {
        self.flavour = Some(flavour.into());
        self
    }

    pub fn with_tree(mut self, tree: Tree) -> Self {
        self.tree = Some(tree);
        self
    }

    pub fn with_vars(mut self, vars: Map<String, JsonValue>) -> Self {
        self.vars = Some(vars);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    /// Short description for logs: `execute 0_1 (from 0)`
    pub fn summary(&self) -> String {
        match &self.from {
            Some(from) => format!("{} {} (from {})", self.point, self.nid, from),
            None => format!("{} {}", self.point, self.nid),
        }
    }
}

/* ===================== Timers & Traces ===================== */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    pub id: Uuid,
    pub exid: String,
    pub nid: String,
    pub schedule: ScheduleSpec,
    pub ntime: DateTime<Utc>,
    /// Times this timer has fired
    pub count: u32,
    /// Message re-injected on firing
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub exid: String,
    pub nid: String,
    pub text: String,
    pub tstamp: DateTime<Utc>,
}

/* ===================== Executions ===================== */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Active,
    Terminated,
    Failed,
}

impl ExecutionStatus {
    pub fn is_over(&self) -> bool {
        !matches!(self, ExecutionStatus::Active)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    /// Messages processed
    pub msgs: u64,
    /// Executor runs
    pub runs: u64,
    /// Sub nids handed out
    pub subs: u64,
    /// Functions defined
    pub funs: u64,
    /// Messages sent to other executions
    pub omsgs: u64,
}
