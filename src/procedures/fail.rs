use anyhow::Result;
use serde_json::Value as JsonValue;

use super::{Ctx, Procedure};
use crate::error::FLOW_ERROR;
use crate::types::Message;

/// `fail "reason"` / `error "reason"`: raises a flow error at this node
pub struct Fail;

impl Procedure for Fail {
    fn receive_last_att(&self, ctx: &mut Ctx, _ncid: usize) -> Result<Vec<Message>> {
        let text = match ctx.node()?.att(None) {
            Some(JsonValue::String(s)) => s.clone(),
            Some(JsonValue::Null) | None => "error".to_string(),
            Some(other) => other.to_string(),
        };
        Ok(ctx.fail(FLOW_ERROR, text))
    }
}
