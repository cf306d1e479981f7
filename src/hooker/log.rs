use anyhow::Result;
use tracing::debug;

use super::{HookContext, HookOptions, Observer};
use crate::types::Message;

/// Logs every consumed message at debug level
pub struct LogHook {
    opts: HookOptions,
}

impl LogHook {
    pub fn new() -> Self {
        Self {
            opts: HookOptions::new().consumed(true),
        }
    }
}

impl Default for LogHook {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for LogHook {
    fn options(&self) -> &HookOptions {
        &self.opts
    }

    fn handle(&self, ctx: &HookContext<'_>, message: &Message) -> Result<Vec<Message>> {
        let heap = ctx
            .node(&message.nid)
            .and_then(|n| n.heap.as_deref())
            .unwrap_or("-");

        debug!(
            exid = %message.exid,
            nid = %message.nid,
            from = message.from.as_deref().unwrap_or("-"),
            point = %message.point,
            heap,
            "{}",
            message.summary()
        );

        Ok(Vec::new())
    }
}
