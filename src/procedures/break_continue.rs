use anyhow::Result;
use std::collections::HashSet;

use super::{Ctx, Procedure};
use crate::types::Message;

/// `break` / `continue`
///
/// Targets the node tagged `ref:`, else the nearest enclosing loop. The
/// target receives a cancel flavoured `break` or `continue`. When the
/// target is not an ancestor, the cascade will never reach this node, so it
/// replies itself with the `ret` it was entered with.
pub struct Break;

fn nearest_loop(ctx: &Ctx) -> Result<Option<String>> {
    let mut seen = HashSet::new();
    let mut current = ctx.node()?.parent.clone();

    while let Some(nid) = current {
        if !seen.insert(nid.clone()) {
            break;
        }
        let Some(node) = ctx.execution.node(&nid) else {
            break;
        };
        if node.heap.as_deref().is_some_and(|h| ctx.registry.is_loop(h)) {
            return Ok(Some(nid));
        }
        current = node.parent.clone();
    }

    Ok(None)
}

impl Procedure for Break {
    fn receive_last_att(&self, ctx: &mut Ctx, _ncid: usize) -> Result<Vec<Message>> {
        let node = ctx.node()?;
        let flavour = ctx.heap()?;
        let positional = node.att(None).cloned();

        let target = match node.att_str(&["ref"]) {
            Some(tag) => ctx.execution.tags_to_nids(&[tag]).into_iter().next(),
            None => nearest_loop(ctx)?,
        };

        if let Some(ret) = positional {
            ctx.payload.set_ret(ret);
        }

        let mut out = Vec::new();

        if let Some(target) = &target {
            out.push(
                ctx.cancel_message(target.clone(), flavour)
                    .with_payload(ctx.payload.clone()),
            );
        }

        let is_ancestor = target
            .as_deref()
            .is_some_and(|t| ctx.execution.is_ancestor(t, &ctx.nid));

        if !is_ancestor {
            let ret = ctx.node()?.payload_ret();
            ctx.payload.set_ret(ret);
            out.extend(ctx.reply()?);
        }

        Ok(out)
    }
}
