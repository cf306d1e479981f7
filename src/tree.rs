//! Flow trees
//!
//! A tree is `[name, children, line]`. Interior nodes carry an ordered list
//! of child trees; atoms (`_num`, `_sqs`, `_boo`, ...) carry a raw JSON value
//! in the children slot. Trees are immutable once parsed.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Children {
    Nodes(Vec<Tree>),
    Atom(JsonValue),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TreeRepr", into = "TreeRepr")]
pub struct Tree {
    pub name: String,
    pub children: Children,
    pub line: usize,
}

type TreeRepr = (String, Children, usize);

impl From<TreeRepr> for Tree {
    fn from((name, children, line): TreeRepr) -> Self {
        Self {
            name,
            children,
            line,
        }
    }
}

impl From<Tree> for TreeRepr {
    fn from(tree: Tree) -> Self {
        (tree.name, tree.children, tree.line)
    }
}

impl Tree {
    pub fn new(name: impl Into<String>, children: Vec<Tree>, line: usize) -> Self {
        Self {
            name: name.into(),
            children: Children::Nodes(children),
            line,
        }
    }

    pub fn atom(name: impl Into<String>, value: JsonValue, line: usize) -> Self {
        Self {
            name: name.into(),
            children: Children::Atom(value),
            line,
        }
    }

    /// Child trees, empty for atoms
    pub fn nodes(&self) -> &[Tree] {
        match &self.children {
            Children::Nodes(nodes) => nodes,
            Children::Atom(_) => &[],
        }
    }

    pub fn atom_value(&self) -> Option<&JsonValue> {
        match &self.children {
            Children::Atom(v) => Some(v),
            Children::Nodes(_) => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        match &self.children {
            Children::Nodes(nodes) => nodes.is_empty(),
            Children::Atom(_) => true,
        }
    }

    pub fn is_att(&self) -> bool {
        self.name == "_att"
    }

    /// Key of a keyed attribute (`tag: 'x'` → `tag`), None for positional ones
    pub fn att_key(&self) -> Option<&str> {
        if !self.is_att() {
            return None;
        }
        match self.nodes() {
            [key, _] => match (key.name.as_str(), key.atom_value()) {
                ("_sqs" | "_dqs", Some(JsonValue::String(s))) => Some(s.as_str()),
                (name, _) if key.is_leaf() => Some(name),
                _ => None,
            },
            _ => None,
        }
    }

    /// Index of the first non-attribute child
    pub fn body_start(&self) -> usize {
        self.nodes()
            .iter()
            .position(|c| !c.is_att())
            .unwrap_or(self.nodes().len())
    }

    /// Descends by child index, None if any index is out of range
    pub fn subtree(&self, path: &[usize]) -> Option<&Tree> {
        let mut current = self;
        for &i in path {
            current = current.nodes().get(i)?;
        }
        Some(current)
    }

    pub fn renamed(&self, name: impl Into<String>) -> Tree {
        Tree {
            name: name.into(),
            children: self.children.clone(),
            line: self.line,
        }
    }
}
