use anyhow::Result;
use serde_json::Value as JsonValue;

use super::{Ctx, Procedure};
use crate::error::PROCEDURE_ERROR;
use crate::schedule::parse_duration;
use crate::types::{Message, Point, ScheduleSpec};

/// `sleep '3s'`, `sleep for: '1m'`, `sleep until: '2030-01-01T00:00:00Z'`
///
/// Schedules a timer addressed to itself and replies when it fires.
pub struct Sleep;

impl Procedure for Sleep {
    fn receive_last_att(&self, ctx: &mut Ctx, _ncid: usize) -> Result<Vec<Message>> {
        let node = ctx.node()?;

        let spec = if let Some(until) = node.att_str(&["until", "at"]) {
            ScheduleSpec::At(until)
        } else {
            let duration = node
                .att(Some("for"))
                .or_else(|| node.att(None))
                .map(|v| match v {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                });
            match duration {
                Some(d) if parse_duration(&d).is_some() => ScheduleSpec::In(d),
                Some(d) => return Ok(ctx.fail(PROCEDURE_ERROR, format!("sleep: cannot read duration {:?}", d))),
                None => return Ok(ctx.fail(PROCEDURE_ERROR, "sleep: missing duration")),
            }
        };

        let exid = ctx.execution.exid.clone();
        let wake = Message::new(Point::Receive, exid.clone(), ctx.nid.clone())
            .from_nid(ctx.nid.clone())
            .with_payload(ctx.payload.clone());

        let mut schedule = Message::new(Point::Schedule, exid, ctx.nid.clone()).from_nid(ctx.nid.clone());
        schedule.schedule = Some(spec);
        schedule.message = Some(Box::new(wake));

        Ok(vec![schedule])
    }
}
