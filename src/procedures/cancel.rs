use anyhow::Result;
use serde_json::Value as JsonValue;

use super::{json_string_list, Ctx, Procedure};
use crate::ids;
use crate::types::Message;

/// `cancel` / `kill`
///
/// Targets are the positional attributes (strings or string lists, other
/// values are dropped), `nid:` and `ref:`. Nids are taken as is, anything
/// else is a tag. One cancel per distinct target, then the node replies.
pub struct Cancel;

impl Procedure for Cancel {
    fn receive_last_att(&self, ctx: &mut Ctx, _ncid: usize) -> Result<Vec<Message>> {
        let node = ctx.node()?;
        let flavour = ctx.heap()?;

        let mut targets: Vec<String> = node
            .atts
            .iter()
            .filter(|(k, _)| k.is_none())
            .filter_map(|(_, v)| json_string_list(v))
            .flatten()
            .collect();

        for key in ["nid", "ref"] {
            targets.extend(
                node.att_a(key)
                    .into_iter()
                    .filter_map(|v| match v {
                        JsonValue::String(s) => Some(s),
                        _ => None,
                    }),
            );
        }

        let (mut nids, tags): (Vec<String>, Vec<String>) = targets.into_iter().partition(|t| ids::is_nid(t));
        if !tags.is_empty() {
            nids.extend(ctx.execution.tags_to_nids(&tags));
        }

        let mut seen = std::collections::HashSet::new();
        nids.retain(|n| seen.insert(n.clone()));

        let mut out: Vec<Message> = nids
            .into_iter()
            .map(|nid| ctx.cancel_message(nid, flavour.clone()))
            .collect();
        out.extend(ctx.reply()?);

        Ok(out)
    }
}
