use anyhow::Result;
use chrono::Utc;
use serde_json::Value as JsonValue;

use super::{Ctx, Procedure};
use crate::types::{Message, Trace};

/// Persists its positional attributes as a trace line
pub struct TraceProc;

impl Procedure for TraceProc {
    fn receive_last_att(&self, ctx: &mut Ctx, _ncid: usize) -> Result<Vec<Message>> {
        let text = ctx
            .node()?
            .atts
            .iter()
            .filter(|(k, _)| k.is_none())
            .map(|(_, v)| match v {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");

        ctx.outbox.traces.push(Trace {
            exid: ctx.execution.exid.clone(),
            nid: ctx.nid.clone(),
            text,
            tstamp: Utc::now(),
        });

        ctx.reply()
    }
}
