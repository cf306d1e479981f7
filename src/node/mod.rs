//! Node views
//!
//! A [`Node`] is a read-only cursor into one position of an execution,
//! built fresh for each message. It resolves variables through the node's
//! parent chain and closures, payload fields through the message, and
//! trees through the nearest materialized ancestor.

mod expand;

use anyhow::Result;
use regex::Regex;
use serde_json::{json, Value as JsonValue};
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::deep;
use crate::error::EngineError;
use crate::execution::{Execution, NodeState};
use crate::ids;
use crate::tree::Tree;
use crate::types::Message;

/// What dynamic (`d.`) lookups and unbound names resolve against
pub trait DynamicScope {
    fn has_procedure(&self, name: &str) -> bool;
    fn has_task(&self, name: &str) -> bool;
}

/// `v` variable or `f` payload field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Var,
    Field,
}

/// `''` nearest, `l` local, `g` global, `d` dynamic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Nearest,
    Local,
    Global,
    Dynamic,
}

fn key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:([lgd])?((?:v|var|variable)|f|fld|field)?\.)?(.+)$").expect("static regex")
    })
}

/// Splits `gv.x.y` into `(Var, Global, "x.y")` and `g.x` into `(Var, Global, "x")`
///
/// Keys that do not parse are taken whole as a variable name.
pub fn key_split(key: &str) -> (Category, Mode, String) {
    let Some(caps) = key_regex().captures(key) else {
        return (Category::Var, Mode::Nearest, key.to_string());
    };
    // a bare leading dot is no prefix
    if caps.get(1).is_none() && caps.get(2).is_none() {
        return (Category::Var, Mode::Nearest, key.to_string());
    }

    let category = match caps.get(2).map(|m| m.as_str()) {
        Some(c) if c.starts_with('f') => Category::Field,
        _ => Category::Var,
    };
    let mode = match caps.get(1).map(|m| m.as_str()) {
        Some("l") => Mode::Local,
        Some("g") => Mode::Global,
        Some("d") => Mode::Dynamic,
        _ => Mode::Nearest,
    };
    let rest = caps.get(3).map(|m| m.as_str()).unwrap_or(key);

    (category, mode, rest.to_string())
}

pub struct Node<'a> {
    execution: &'a Execution,
    nid: String,
    message: Option<&'a Message>,
    scope: Option<&'a dyn DynamicScope>,
}

impl<'a> Node<'a> {
    pub fn new(execution: &'a Execution, nid: impl Into<String>, message: Option<&'a Message>) -> Self {
        Self {
            execution,
            nid: nid.into(),
            message,
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: &'a dyn DynamicScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn exid(&self) -> &str {
        &self.execution.exid
    }

    pub fn nid(&self) -> &str {
        &self.nid
    }

    pub fn state(&self) -> Option<&'a NodeState> {
        self.execution.node(&self.nid)
    }

    pub fn parent(&self) -> Option<&'a str> {
        self.state().and_then(|n| n.parent.as_deref())
    }

    pub fn fei(&self) -> String {
        ids::fei(self.exid(), &self.nid)
    }

    pub fn tree(&self) -> Option<&'a Tree> {
        self.execution.lookup_tree(&self.nid)
    }

    /// Resolves `name` (`x`, `v.x`, `gv.x.y`, `f.ret`, `d.sequence`)
    pub fn lookup(&self, name: &str) -> Result<Option<JsonValue>> {
        let (category, mode, key) = key_split(name);
        let (key, path) = match key.split_once('.') {
            Some((k, p)) => (k.to_string(), Some(p.to_string())),
            None => (key, None),
        };

        let value = match category {
            Category::Var => self.lookup_var(mode, &key)?,
            Category::Field => self.lookup_field(&key),
        };

        Ok(match (value, path) {
            (Some(v), Some(p)) => deep::deep_get(&v, &p).1.cloned(),
            (v, None) => v,
            (None, _) => None,
        })
    }

    /// Strings are looked up, anything else is returned as is
    pub fn deref(&self, value: &JsonValue) -> Result<Option<JsonValue>> {
        match value {
            JsonValue::String(s) => self.lookup(s),
            other => Ok(Some(other.clone())),
        }
    }

    fn lookup_field(&self, key: &str) -> Option<JsonValue> {
        self.message
            .and_then(|m| m.payload.current().get(key))
            .cloned()
    }

    fn lookup_dvar(&self, key: &str) -> Option<JsonValue> {
        let scope = self.scope?;
        if scope.has_procedure(key) {
            Some(json!(["_proc", key, -1]))
        } else if scope.has_task(key) {
            Some(json!(["_task", key, -1]))
        } else {
            None
        }
    }

    fn lookup_var(&self, mode: Mode, key: &str) -> Result<Option<JsonValue>> {
        match mode {
            Mode::Dynamic => Ok(self.lookup_dvar(key)),
            Mode::Global => self.lookup_global(key),
            Mode::Local => Ok(self.lookup_local(key)),
            Mode::Nearest => Ok(self.lookup_nearest(key)),
        }
    }

    /// Walks the parent chain, checking each node's closure before moving up
    fn lookup_nearest(&self, key: &str) -> Option<JsonValue> {
        let mut seen = HashSet::new();
        let mut current = self.state();

        while let Some(node) = current {
            if !seen.insert(node.nid.as_str()) {
                break;
            }
            if let Some(v) = node.vars.as_ref().and_then(|vars| vars.get(key)) {
                return Some(v.clone());
            }
            if let Some(cnid) = node.cnid.as_deref().filter(|c| *c != node.nid) {
                let cvars = self.execution.node(cnid).and_then(|c| c.vars.as_ref());
                if let Some(v) = cvars.and_then(|vars| vars.get(key)) {
                    return Some(v.clone());
                }
            }
            // detached handler runs continue through their closure
            current = node
                .parent
                .as_deref()
                .or(node.cnid.as_deref())
                .and_then(|p| self.execution.node(p));
        }

        self.lookup_dvar(key)
    }

    /// Only the nearest scope holding vars is consulted
    fn lookup_local(&self, key: &str) -> Option<JsonValue> {
        let mut seen = HashSet::new();
        let mut current = self.state();

        while let Some(node) = current {
            if !seen.insert(node.nid.as_str()) {
                break;
            }
            if let Some(vars) = &node.vars {
                return vars.get(key).cloned();
            }
            current = node
                .parent
                .as_deref()
                .and_then(|p| self.execution.node(p));
        }

        None
    }

    /// Walks straight to the outermost node and reads its vars
    fn lookup_global(&self, key: &str) -> Result<Option<JsonValue>> {
        let Some(mut node) = self.state() else {
            return Ok(self.lookup_dvar(key));
        };
        let mut seen = HashSet::new();

        while let Some(parent) = node
            .parent
            .as_deref()
            .and_then(|p| self.execution.node(p))
        {
            if !seen.insert(parent.nid.as_str()) {
                break;
            }
            node = parent;
        }

        match &node.vars {
            Some(vars) => Ok(vars.get(key).cloned()),
            None => Err(EngineError::Rootless(node.nid.clone()).into()),
        }
    }
}

#[cfg(test)]
mod tests;
