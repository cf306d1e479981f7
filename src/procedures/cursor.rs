use anyhow::Result;

use super::{finish_cancel, Ctx, Procedure};
use crate::types::Message;

/// Loop-flavoured sequence
///
/// `break` ends it, `continue` restarts it at its first body child. With
/// `restart_at_end` (the `loop` procedure) reaching the end restarts it too.
pub struct Cursor {
    pub restart_at_end: bool,
}

impl Cursor {
    fn restart(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        let start = ctx.tree()?.body_start();
        ctx.execute_child(start)
    }
}

impl Procedure for Cursor {
    fn is_loop(&self) -> bool {
        true
    }

    fn receive_last(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        let tree = ctx.tree()?;
        if self.restart_at_end && tree.body_start() < tree.nodes().len() {
            return self.restart(ctx);
        }
        ctx.reply()
    }

    fn receive_when_cancelling(&self, ctx: &mut Ctx) -> Result<Vec<Message>> {
        let node = ctx.node()?;
        if !node.cnodes.is_empty() {
            return Ok(Vec::new());
        }

        let flavour = node.cancelling.clone();

        match flavour.as_deref() {
            Some("continue") => {
                let node = ctx.node_mut()?;
                node.cancelling = None;
                if let Some(adopted) = node.adopted.take() {
                    ctx.payload = adopted;
                }
                if ctx.tree()?.body_start() < ctx.tree()?.nodes().len() {
                    self.restart(ctx)
                } else {
                    ctx.reply()
                }
            }
            _ => finish_cancel(ctx),
        }
    }
}
