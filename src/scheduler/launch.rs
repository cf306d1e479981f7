//! Launching flows and building messages for running executions

use anyhow::Result;
use serde_json::{Map, Value as JsonValue};

use super::Scheduler;
use crate::error::EngineError;
use crate::hooker::WaitSpec;
use crate::ids;
use crate::payload::Payload;
use crate::types::{Message, Point};

/// Options for [`Scheduler::launch`]
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub domain: Option<String>,
    pub unit: Option<String>,
    /// Blocks the caller until the execution matches
    pub wait: Option<WaitSpec>,
    /// Keeps removed nodes in memory, for every later launch too
    pub archive: bool,
    /// Builds the launch message without queueing it
    pub nolaunch: bool,
    pub payload: Option<Payload>,
    pub vars: Option<Map<String, JsonValue>>,
    pub journal: bool,
}

impl LaunchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn wait(mut self, spec: WaitSpec) -> Self {
        self.wait = Some(spec);
        self
    }

    pub fn archive(mut self, archive: bool) -> Self {
        self.archive = archive;
        self
    }

    pub fn nolaunch(mut self, nolaunch: bool) -> Self {
        self.nolaunch = nolaunch;
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn vars(mut self, vars: Map<String, JsonValue>) -> Self {
        self.vars = Some(vars);
        self
    }

    pub fn journal(mut self, journal: bool) -> Self {
        self.journal = journal;
        self
    }
}

/// Outcome of queueing a message
#[derive(Debug, Clone)]
pub enum Launched {
    /// Queued, caller did not wait
    Queued(String),
    /// The message the caller waited for
    Done(Message),
    /// `nolaunch`: built but not queued
    Prepared(Message),
}

impl Launched {
    pub fn exid(&self) -> &str {
        match self {
            Launched::Queued(exid) => exid,
            Launched::Done(message) | Launched::Prepared(message) => &message.exid,
        }
    }

    /// The resulting message, None when merely queued
    pub fn message(&self) -> Option<&Message> {
        match self {
            Launched::Queued(_) => None,
            Launched::Done(message) | Launched::Prepared(message) => Some(message),
        }
    }
}

/// Fields for messages addressed to a running execution
#[derive(Debug, Clone, Default)]
pub struct MessageRequest {
    pub exid: Option<String>,
    pub nid: Option<String>,
    pub name: Option<String>,
    pub payload: Option<Payload>,
    pub wait: Option<WaitSpec>,
}

impl MessageRequest {
    pub fn new(exid: impl Into<String>) -> Self {
        Self {
            exid: Some(exid.into()),
            ..Self::default()
        }
    }

    pub fn nid(mut self, nid: impl Into<String>) -> Self {
        self.nid = Some(nid.into());
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn wait(mut self, spec: WaitSpec) -> Self {
        self.wait = Some(spec);
        self
    }
}

impl Scheduler {
    /// Launches a flow, from a dotted flow path or from source
    pub async fn launch(&self, source_or_path: &str, opts: LaunchOptions) -> Result<Launched> {
        let (domain, flow_name) = match ids::split_flow_name(source_or_path) {
            Some((domain, name)) => (opts.domain.clone().unwrap_or(domain), Some(name)),
            None => {
                let domain = opts
                    .domain
                    .clone()
                    .or_else(|| self.config().domain.clone())
                    .unwrap_or_else(|| "domain0".to_string());
                (domain, None)
            }
        };

        if !ids::is_domain_name(&domain) {
            return Err(EngineError::InvalidDomain(domain).into());
        }

        let source = match flow_name {
            Some(_) => self.loader().library(source_or_path),
            None => Some(source_or_path.to_string()),
        };
        let Some(source) = source else {
            return Err(EngineError::FlowNotFound(truncate(source_or_path, 35)).into());
        };

        let tree = self
            .parser()
            .parse(&source)
            .map_err(|e| EngineError::ParseFailure(format!("{:#}", e)))?;

        if opts.archive {
            self.enable_archive();
        }

        let unit = opts.unit.clone().unwrap_or_else(|| self.config().unit.clone());
        let exid = ids::generate_exid(&domain, &unit);

        let mut message = Message::new(Point::Execute, exid, "0")
            .with_tree(tree)
            .with_payload(opts.payload.unwrap_or_default())
            .with_vars(opts.vars.unwrap_or_default());
        message.journal = opts.journal;

        if opts.nolaunch {
            return Ok(Launched::Prepared(message));
        }

        self.queue(message, opts.wait).await
    }

    /// Builds a message for a running execution
    pub fn prepare_message(&self, point: Point, req: &MessageRequest) -> Result<Message> {
        let exid = req.exid.as_deref().ok_or(EngineError::MissingField("exid"))?;

        let mut message = Message::new(point, exid, req.nid.as_deref().unwrap_or("0"));
        if let Some(payload) = &req.payload {
            message = message.with_payload(payload.clone());
        }
        match (&req.name, point) {
            (Some(name), _) => message = message.with_name(name.clone()),
            (None, Point::Signal) => return Err(EngineError::MissingField("name").into()),
            (None, _) => {}
        }

        Ok(message)
    }

    /// Cancels a node, the root when no nid is given
    pub async fn cancel(&self, req: MessageRequest) -> Result<Launched> {
        let message = self.prepare_message(Point::Cancel, &req)?;
        self.queue(message, req.wait).await
    }

    pub async fn signal(&self, name: &str, mut req: MessageRequest) -> Result<Launched> {
        req.name.get_or_insert_with(|| name.to_string());
        req.payload.get_or_insert_with(Payload::new);
        let message = self.prepare_message(Point::Signal, &req)?;
        self.queue(message, req.wait).await
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}...", &s[..i]),
        None => s.to_string(),
    }
}
