use anyhow::Result;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;

use super::{Ctx, Procedure};
use crate::deep;
use crate::error::EngineError;
use crate::node::{key_split, Category, Mode};
use crate::types::Message;

/// `set a: 1, f.b: 2` or `set a \n <body>`
///
/// Keyed attributes are assigned their value. Positional string attributes
/// name targets that receive the `ret` left by the body.
pub struct Set;

/// Nids from `nid` up to the outermost node
fn chain(ctx: &Ctx) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut current = Some(ctx.nid.clone());

    while let Some(nid) = current {
        if !seen.insert(nid.clone()) {
            break;
        }
        current = ctx.execution.node(&nid).and_then(|n| n.parent.clone());
        out.push(nid);
    }
    out
}

fn scope_for(ctx: &Ctx, mode: Mode, key: &str) -> Result<String> {
    let chain = chain(ctx);
    let holding: Vec<&String> = chain
        .iter()
        .filter(|nid| ctx.execution.node(nid).is_some_and(|n| n.vars.is_some()))
        .collect();

    let root = || {
        let top = chain.last().cloned().unwrap_or_else(|| ctx.nid.clone());
        match ctx.execution.node(&top) {
            Some(n) if n.vars.is_some() => Ok(top),
            _ => Err(EngineError::Rootless(top)),
        }
    };

    let nid = match mode {
        Mode::Global => root()?,
        Mode::Local => match holding.first() {
            Some(n) => (*n).clone(),
            None => root()?,
        },
        Mode::Nearest | Mode::Dynamic => {
            let binding = holding.iter().find(|nid| {
                ctx.execution
                    .node(nid)
                    .and_then(|n| n.vars.as_ref())
                    .is_some_and(|v| v.contains_key(key))
            });
            match binding.or(holding.first()) {
                Some(n) => (*n).clone(),
                None => root()?,
            }
        }
    };
    Ok(nid)
}

fn assign(ctx: &mut Ctx, target: &str, value: JsonValue) -> Result<()> {
    let (category, mode, path) = key_split(target);

    if category == Category::Field {
        ctx.payload.set(&path, value);
        return Ok(());
    }

    let key = path.split('.').next().unwrap_or(&path).to_string();
    let nid = scope_for(ctx, mode, &key)?;

    if let Some(node) = ctx.execution.node_mut(&nid) {
        let vars = node.vars.get_or_insert_with(Map::new);
        if key == path {
            vars.insert(key, value);
        } else {
            let mut root = JsonValue::Object(std::mem::take(vars));
            deep::deep_set(&mut root, &path, value);
            if let JsonValue::Object(map) = root {
                *vars = map;
            }
        }
    }
    Ok(())
}

impl Procedure for Set {
    fn receive_last(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        let ret = ctx.payload.ret().cloned().unwrap_or(JsonValue::Null);
        let atts = ctx.node()?.atts.clone();

        for (key, value) in atts {
            match (key, value) {
                (Some(key), value) => assign(ctx, &key, value)?,
                (None, JsonValue::String(target)) => assign(ctx, &target, ret.clone())?,
                _ => {}
            }
        }

        ctx.reply()
    }
}
