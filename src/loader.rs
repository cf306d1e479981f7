//! Flow libraries and parsing
//!
//! A [`Loader`] turns a dotted flow path (`com.acme.flow0`) into source
//! text; a [`FlowParser`] turns source into a [`Tree`].

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::ids;
use crate::tree::Tree;

pub trait Loader: Send + Sync {
    /// Source of the flow at `path`, None when unknown
    fn library(&self, path: &str) -> Option<String>;
}

pub trait FlowParser: Send + Sync {
    fn parse(&self, source: &str) -> Result<Tree>;
}

/* ===================== Filesystem ===================== */

/// Reads `<flows_dir>/<domain>/<name>.json`, falling back to a directory
/// per domain segment (`com/acme/flow0.json`)
pub struct FsLoader {
    root: PathBuf,
}

impl FsLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn candidates(&self, domain: &str, name: &str) -> [PathBuf; 2] {
        let file = format!("{}.json", name);
        let nested: PathBuf = domain.split('.').collect();
        [self.root.join(domain).join(&file), self.root.join(nested).join(&file)]
    }
}

impl Loader for FsLoader {
    fn library(&self, path: &str) -> Option<String> {
        let (domain, name) = ids::split_flow_name(path)?;

        self.candidates(&domain, &name).into_iter().find_map(|candidate| {
            let source = std::fs::read_to_string(&candidate).ok()?;
            debug!(flow = %path, file = %candidate.display(), "Loaded flow");
            Some(source)
        })
    }
}

/* ===================== Memory ===================== */

/// Flows registered in process, for tests and embedding
#[derive(Default)]
pub struct MemoryLoader {
    flows: Mutex<HashMap<String, String>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flow(self, path: impl Into<String>, source: impl Into<String>) -> Self {
        self.add(path, source);
        self
    }

    pub fn add(&self, path: impl Into<String>, source: impl Into<String>) {
        self.flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), source.into());
    }
}

impl Loader for MemoryLoader {
    fn library(&self, path: &str) -> Option<String> {
        self.flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }
}

/* ===================== Parser ===================== */

/// Reads the canonical `[name, children, line]` JSON form
pub struct JsonTreeParser;

impl FlowParser for JsonTreeParser {
    fn parse(&self, source: &str) -> Result<Tree> {
        serde_json::from_str(source.trim()).context("Failed to parse flow tree")
    }
}
