//! Value-producing procedures: attributes, literals, arrays, references
//! and synchronous tasks

use anyhow::Result;
use serde_json::Value as JsonValue;

use super::{tagged_name, Ctx, Procedure};
use crate::error::PROCEDURE_ERROR;
use crate::tree::Tree;
use crate::types::Message;

/// Bare names in attribute position are read, not applied: `on_error: h`
/// hands over the function `h` itself.
fn bare_name(tree: &Tree) -> Option<&str> {
    match tree.nodes() {
        [] if tree.atom_value().is_none() && !tree.name.starts_with('_') => Some(&tree.name),
        _ => None,
    }
}

/// `_att`: evaluates its value child, the key child is read from the tree
pub struct Att;

impl Procedure for Att {
    fn evaluates_atts(&self) -> bool {
        false
    }

    fn execute(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        let tree = ctx.tree()?;
        let index = if tree.nodes().len() == 2 { 1 } else { 0 };

        let Some(child) = tree.nodes().get(index) else {
            ctx.payload.set_ret(JsonValue::Null);
            return ctx.reply();
        };

        if let Some(name) = bare_name(child) {
            if let Some(value) = ctx.view().lookup(name)? {
                ctx.payload.set_ret(value);
                return ctx.reply();
            }
        }

        ctx.execute_child(index)
    }

    fn receive_non_att(&self, ctx: &mut Ctx, _ncid: usize) -> Result<Vec<Message>> {
        ctx.reply()
    }
}

/// `_sqs`, `_num`, `_boo`, `_nul`
pub struct Atom;

impl Procedure for Atom {
    fn execute(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        let value = ctx.tree()?.atom_value().cloned().unwrap_or(JsonValue::Null);
        ctx.payload.set_ret(value);
        ctx.reply()
    }
}

/// `_dqs`: a string with `$(...)` placeholders
pub struct DoubleQuoted;

impl Procedure for DoubleQuoted {
    fn execute(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        let value = match ctx.tree()?.atom_value() {
            Some(JsonValue::String(s)) => ctx.view().expand(s)?,
            Some(other) => other.clone(),
            None => JsonValue::Null,
        };
        ctx.payload.set_ret(value);
        ctx.reply()
    }
}

/// `_arr`: evaluates each element in turn
pub struct Array;

impl Procedure for Array {
    fn receive_non_att(&self, ctx: &mut Ctx, ncid: usize) -> Result<Vec<Message>> {
        if ncid > 0 {
            let value = ctx.payload.ret().cloned().unwrap_or(JsonValue::Null);
            ctx.node_mut()?.atts.push((None, value));
        }

        if ncid < ctx.tree()?.nodes().len() {
            return ctx.execute_child(ncid);
        }

        let values = ctx.node()?.atts.iter().map(|(_, v)| v.clone()).collect();
        ctx.payload.set_ret(JsonValue::Array(values));
        ctx.reply()
    }
}

/// A leaf whose head resolved to a plain value
pub struct Reference;

impl Procedure for Reference {
    fn execute(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        let value = ctx.node()?.heat.clone().unwrap_or(JsonValue::Null);
        ctx.payload.set_ret(value);
        ctx.reply()
    }
}

/// Hands the evaluated attributes to a registered task handler
pub struct Task;

impl Procedure for Task {
    fn receive_last_att(&self, ctx: &mut Ctx, _ncid: usize) -> Result<Vec<Message>> {
        let node = ctx.node()?;
        let name = node
            .heat
            .as_ref()
            .and_then(|h| tagged_name(h, "_task"))
            .unwrap_or_default()
            .to_string();
        let atts = node.atts.clone();

        let Some(handler) = ctx.registry.task(&name) else {
            return Ok(ctx.fail(PROCEDURE_ERROR, format!("no task handler for {:?}", name)));
        };

        match handler(&name, &atts, &ctx.payload) {
            Ok(ret) => {
                ctx.payload.set_ret(ret);
                ctx.reply()
            }
            Err(e) => Ok(ctx.fail(PROCEDURE_ERROR, format!("task {} failed: {:#}", name, e))),
        }
    }
}
