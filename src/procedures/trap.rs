use anyhow::Result;
use serde_json::{Map, Value as JsonValue};

use super::{define, Ctx, Procedure};
use crate::hooker::{DomainPattern, HookOptions, Trap};
use crate::ids;
use crate::types::Message;

/// `trap point: 'signal', name: 'go'`
///
/// Without a body the trap blocks: it stays until the first matching
/// message, then replies with that message's payload. With a function as
/// body it replies at once and runs the function on every match for as
/// long as the enclosing node lives.
///
/// Traps watch their own execution unless `range:` widens them to the
/// `domain` or `subdomain`, or explicit `exid:` / `domain:` keys are given.
pub struct TrapProc;

fn options(ctx: &Ctx) -> Result<HookOptions> {
    let node = ctx.node()?;

    let mut map = Map::new();
    for (key, value) in &node.atts {
        if let Some(key) = key {
            map.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    if !node.tags.is_empty() && !map.contains_key("tags") {
        map.insert("tags".to_string(), node.tags.clone().into());
    }

    let mut opts = HookOptions::from_json(&JsonValue::Object(map)).consumed(true);

    if opts.exid.is_none() && opts.domains.is_none() && opts.subdomains.is_none() {
        let exid = ctx.execution.exid.clone();
        let domain = ids::exid_domain(&exid).unwrap_or_default().to_string();
        match node.att_str(&["range"]).as_deref() {
            Some("domain") => opts.domains = Some(vec![DomainPattern::Exact(domain)]),
            Some("subdomain") => opts.subdomains = Some(vec![domain]),
            _ => opts.exid = Some(exid),
        }
    }

    Ok(opts)
}

impl Procedure for TrapProc {
    fn receive_last(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        let opts = options(ctx)?;
        let tree = ctx.tree()?;
        let node = ctx.node()?;
        let has_body = tree.body_start() < tree.nodes().len();
        let handler = ctx
            .payload
            .ret()
            .filter(|r| has_body && define::is_func(r))
            .cloned();

        let count = node
            .att(Some("count"))
            .and_then(JsonValue::as_u64)
            .and_then(|c| u32::try_from(c).ok());

        let exid = ctx.execution.exid.clone();

        match handler {
            Some(handler) => {
                let bnid = node.parent.clone().unwrap_or_else(|| "0".to_string());
                let entry_ret = node.payload_ret();

                let mut trap = Trap::new(exid, ctx.nid.clone(), bnid, opts);
                trap.handler = Some(handler);
                trap.count = count;
                ctx.outbox.traps.push(trap);

                ctx.payload.set_ret(entry_ret);
                ctx.reply()
            }
            None => {
                let mut trap = Trap::new(exid, ctx.nid.clone(), ctx.nid.clone(), opts);
                trap.count = Some(1);
                ctx.outbox.traps.push(trap);
                Ok(Vec::new())
            }
        }
    }

    fn trigger(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        if let Some(caught) = &ctx.message.message {
            ctx.payload = caught.payload.clone();
        }
        ctx.reply()
    }
}
