//! Persisted execution state: the node map of one running flow instance

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeSet, HashMap};

use crate::error::ErrorInfo;
use crate::ids;
use crate::payload::Payload;
use crate::tree::Tree;
use crate::types::{Counters, ExecutionStatus, Message};

/// State of one live node, keyed by nid in [`Execution::nodes`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub nid: String,
    pub parent: Option<String>,

    /// Only set at materialization points (root, function bodies, handlers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<Tree>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<Map<String, JsonValue>>,

    /// Closure node id: the scope captured when the running function was defined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cnid: Option<String>,

    /// Procedure driving this node (`sequence`, `cursor`, `_apply`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap: Option<String>,

    /// Head name as written in the tree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heat0: Option<String>,

    /// Resolved head value (`["_proc", ..]`, `["_func", ..]`, a plain value)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heat: Option<JsonValue>,

    #[serde(default)]
    pub atts: Vec<(Option<String>, JsonValue)>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<JsonValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Live children, in the order they were started
    #[serde(default)]
    pub cnodes: Vec<String>,

    /// Cancel flavour once a cancel reached this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelling: Option<String>,

    /// Payload handed over by the cancel message, replaces the reply payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adopted: Option<Payload>,

    /// Error being handled by this node's `on_error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    /// Detached nodes (trap handler runs) reply to nobody
    #[serde(default)]
    pub detached: bool,

    /// Payload at entry, its `ret` is restored after each attribute
    #[serde(default)]
    pub payload: Payload,

    pub created_at: DateTime<Utc>,
}

impl NodeState {
    pub fn new(nid: impl Into<String>, parent: Option<String>) -> Self {
        Self {
            nid: nid.into(),
            parent,
            tree: None,
            vars: None,
            cnid: None,
            heap: None,
            heat0: None,
            heat: None,
            atts: Vec::new(),
            on_error: Vec::new(),
            tags: Vec::new(),
            cnodes: Vec::new(),
            cancelling: None,
            adopted: None,
            error: None,
            detached: false,
            payload: Payload::new(),
            created_at: Utc::now(),
        }
    }

    /// First attribute value under `key` (None key for positional ones)
    pub fn att(&self, key: Option<&str>) -> Option<&JsonValue> {
        self.atts
            .iter()
            .find(|(k, _)| k.as_deref() == key)
            .map(|(_, v)| v)
    }

    pub fn has_att(&self, key: Option<&str>) -> bool {
        self.att(key).is_some()
    }

    /// All values under `key`, arrays flattened one level
    pub fn att_a(&self, key: &str) -> Vec<JsonValue> {
        self.atts
            .iter()
            .filter(|(k, _)| k.as_deref() == Some(key))
            .flat_map(|(_, v)| match v {
                JsonValue::Array(a) => a.clone(),
                other => vec![other.clone()],
            })
            .collect()
    }

    /// First string value among `keys`
    pub fn att_str(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .find_map(|k| self.att(Some(k)))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// `ret` the node was entered with
    pub fn payload_ret(&self) -> JsonValue {
        self.payload.ret().cloned().unwrap_or(JsonValue::Null)
    }
}

/// One flow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub exid: String,
    pub nodes: HashMap<String, NodeState>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub counters: Counters,
    /// Every processed message, kept when the launch asked for a journal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(exid: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            exid: exid.into(),
            nodes: HashMap::new(),
            status: ExecutionStatus::Active,
            counters: Counters::default(),
            journal: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn node(&self, nid: &str) -> Option<&NodeState> {
        self.nodes.get(nid)
    }

    pub fn node_mut(&mut self, nid: &str) -> Option<&mut NodeState> {
        self.nodes.get_mut(nid)
    }

    /// Hands out the next sub counter
    pub fn next_sub(&mut self) -> u64 {
        self.counters.subs += 1;
        self.counters.subs
    }

    /// Nids of the nodes carrying any of `tags`, in structural order
    pub fn tags_to_nids(&self, tags: &[String]) -> Vec<String> {
        let nids: BTreeSet<&String> = self
            .nodes
            .values()
            .filter(|n| n.tags.iter().any(|t| tags.contains(t)))
            .map(|n| &n.nid)
            .collect();
        nids.into_iter().cloned().collect()
    }

    /// Tree at `nid`
    ///
    /// Climbs nid ancestry to the nearest node holding a materialized tree,
    /// then descends by child index. Nodes absent from the map are walked
    /// through by their nid alone, so un-instantiated children resolve too.
    pub fn lookup_tree(&self, nid: &str) -> Option<&Tree> {
        let mut path = Vec::new();
        let mut current = nid.to_string();

        loop {
            if let Some(tree) = self.nodes.get(&current).and_then(|n| n.tree.as_ref()) {
                path.reverse();
                return tree.subtree(&path);
            }

            let parent = ids::parent_id(&current)?;
            path.push(ids::child_id(&current));
            current = parent;
        }
    }

    /// Whether `ancestor` lies on the parent chain of `nid` (self excluded)
    pub fn is_ancestor(&self, ancestor: &str, nid: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut current = self.nodes.get(nid).and_then(|n| n.parent.clone());

        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            if !seen.insert(c.clone()) {
                return false;
            }
            current = self.nodes.get(&c).and_then(|n| n.parent.clone());
        }

        ids::is_descendant_of(nid, ancestor, false)
    }
}
