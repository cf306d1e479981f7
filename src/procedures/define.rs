//! Functions: `define`, `def`, `fun` build closures, `_apply` calls them
//!
//! A function value is `["_func", {"nid", "cnid", "fun"}, line]`: the nid
//! of the defining node (its tree is the function body), the closure node
//! whose vars the body sees, and a per-execution function counter.

use anyhow::{Context, Result};
use serde_json::{json, Map, Value as JsonValue};

use super::{Ctx, Procedure};
use crate::error::EngineError;
use crate::execution::Execution;
use crate::ids;
use crate::tree::Tree;
use crate::types::{Message, Point};

pub fn is_func(value: &JsonValue) -> bool {
    matches!(
        value.as_array().map(Vec::as_slice),
        Some([JsonValue::String(t), JsonValue::Object(_), _]) if t == "_func"
    )
}

fn func_field<'v>(func: &'v JsonValue, key: &str) -> Option<&'v str> {
    func.get(1).and_then(|o| o.get(key)).and_then(JsonValue::as_str)
}

/// Leaf names of the leading single-child attributes: `define sum a b`
fn param_names(tree: &Tree) -> Vec<String> {
    tree.nodes()
        .iter()
        .take_while(|c| c.is_att())
        .filter_map(|att| match att.nodes() {
            [leaf] if leaf.is_leaf() && leaf.atom_value().is_none() => Some(leaf.name.clone()),
            [leaf] => match (leaf.name.as_str(), leaf.atom_value()) {
                ("_sqs" | "_dqs", Some(JsonValue::String(s))) => Some(s.clone()),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

/// Builds the `execute` message that runs `func`
///
/// Parameters bind from `keyed` by name, else from `args` by position; the
/// body also sees `arguments` and every keyed entry. The returned message
/// targets a fresh sub nid and carries the body tree, so it needs only a
/// sender and a payload.
pub fn function_application(
    execution: &mut Execution,
    func: &JsonValue,
    args: Vec<JsonValue>,
    keyed: Map<String, JsonValue>,
) -> Result<Message> {
    let fnid = func_field(func, "nid")
        .map(str::to_string)
        .ok_or_else(|| EngineError::CannotApply(func.to_string()))?;
    let cnid = func_field(func, "cnid").map(str::to_string);

    let definition = execution
        .lookup_tree(&fnid)
        .with_context(|| format!("Failed to find function tree at {}", fnid))?;

    let mut params = param_names(definition);
    if definition.name == "define" && !params.is_empty() {
        params.remove(0);
    }
    let tree = definition.renamed("_fun");

    let mut vars = Map::new();
    for (i, param) in params.iter().enumerate() {
        let value = keyed
            .get(param)
            .cloned()
            .or_else(|| args.get(i).cloned())
            .unwrap_or(JsonValue::Null);
        vars.insert(param.clone(), value);
    }
    vars.extend(keyed);
    vars.insert("arguments".to_string(), JsonValue::Array(args));

    let sub = execution.next_sub();
    let nid = ids::sub_nid(&fnid, sub);

    let mut message = Message::new(Point::Execute, execution.exid.clone(), nid)
        .with_tree(tree)
        .with_vars(vars);
    message.cnid = cnid;

    Ok(message)
}

/// `define name a b`, `def a b`, `fun a b`
pub struct Define;

impl Procedure for Define {
    fn evaluates_atts(&self) -> bool {
        false
    }

    fn execute(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        let tree = ctx.tree()?;
        let heap = ctx.heap()?;
        let params = param_names(&tree);
        let name = match heap.as_str() {
            "define" => params.first().cloned(),
            _ => None,
        };

        // closure scope: nearest node holding vars, else the parent
        let cnid = {
            let mut current = ctx.node()?.parent.clone();
            let mut found = None;
            while let Some(nid) = current {
                match ctx.execution.node(&nid) {
                    Some(n) if n.vars.is_some() => {
                        found = Some(nid);
                        break;
                    }
                    Some(n) => current = n.parent.clone(),
                    None => break,
                }
            }
            found.or_else(|| ctx.node().ok().and_then(|n| n.parent.clone()))
        };

        ctx.execution.counters.funs += 1;
        let func = json!([
            "_func",
            { "nid": ctx.nid, "cnid": cnid, "fun": ctx.execution.counters.funs },
            tree.line
        ]);

        if let Some(name) = name {
            let scope = cnid.as_deref().and_then(|c| ctx.execution.node_mut(c));
            if let Some(scope) = scope {
                scope
                    .vars
                    .get_or_insert_with(Map::new)
                    .insert(name, func.clone());
            }
        }

        ctx.payload.set_ret(func);
        ctx.reply()
    }
}

/// Calls the function held in the node's heat
pub struct Apply;

impl Procedure for Apply {
    fn receive_last_att(&self, ctx: &mut Ctx, _ncid: usize) -> Result<Vec<Message>> {
        let node = ctx.node()?;
        let func = node.heat.clone().unwrap_or(JsonValue::Null);

        let mut args = Vec::new();
        let mut keyed = Map::new();
        for (key, value) in &node.atts {
            match key {
                Some(k) => {
                    keyed.insert(k.clone(), value.clone());
                }
                None => args.push(value.clone()),
            }
        }

        let message = function_application(ctx.execution, &func, args, keyed)?
            .from_nid(ctx.nid.clone())
            .with_payload(ctx.payload.clone());
        ctx.node_mut()?.cnodes.push(message.nid.clone());

        Ok(vec![message])
    }

    /// The function body replied
    fn receive_other(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        ctx.reply()
    }
}
