use anyhow::Result;

use super::{Ctx, Procedure};
use crate::types::Message;

/// Runs the body children one after the other
pub struct Sequence;

impl Procedure for Sequence {}

/// Body of an applied function: parameters are bound already, so the
/// leading attributes are skipped
pub struct FunctionBody;

impl Procedure for FunctionBody {
    fn evaluates_atts(&self) -> bool {
        false
    }
}

/// Starts every body child at once, replies with the last reply
pub struct Concurrence;

impl Procedure for Concurrence {
    fn receive_last_att(&self, ctx: &mut Ctx, ncid: usize) -> Result<Vec<Message>> {
        let len = ctx.tree()?.nodes().len();
        if ncid >= len {
            return ctx.reply();
        }

        let mut out = Vec::new();
        for index in ncid..len {
            out.extend(ctx.execute_child(index)?);
        }
        Ok(out)
    }

    fn receive_non_att(&self, ctx: &mut Ctx, _ncid: usize) -> Result<Vec<Message>> {
        if ctx.node()?.cnodes.is_empty() {
            ctx.reply()
        } else {
            Ok(Vec::new())
        }
    }
}
