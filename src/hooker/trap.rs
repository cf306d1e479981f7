use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{matches, HookContext, HookOptions, Observer};
use crate::ids;
use crate::types::{Message, Point};

/// Observer registered from flow text by the `trap` procedure
///
/// A trap lives as long as the node it is bound to (`bnid`). Handler traps
/// bind to the enclosing node and run their `_func` on every trigger;
/// blocking traps bind to themselves and make the trap node reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trap {
    pub id: Uuid,
    pub exid: String,
    /// The trap node
    pub nid: String,
    /// Node the trap is bound to
    pub bnid: String,
    pub opts: HookOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<JsonValue>,
    /// Remaining triggers, unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Trap {
    pub fn new(exid: impl Into<String>, nid: impl Into<String>, bnid: impl Into<String>, opts: HookOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            exid: exid.into(),
            nid: nid.into(),
            bnid: bnid.into(),
            opts,
            handler: None,
            count: None,
            created_at: Utc::now(),
        }
    }

    /// Whether `message` comes from inside the trap's own subtree
    pub fn within_itself(&self, message: &Message) -> bool {
        if message.exid != self.exid {
            return false;
        }
        let origin = message.from.as_deref().unwrap_or(&message.nid);
        ids::is_descendant_of(origin, &self.nid, true)
    }

    pub fn trigger_message(&self, caught: &Message) -> Message {
        let mut trigger = Message::new(Point::Trigger, self.exid.clone(), self.nid.clone())
            .with_payload(caught.payload.clone());
        trigger.trap_id = Some(self.id);
        trigger.message = Some(Box::new(caught.clone()));
        trigger
    }
}

impl Observer for Trap {
    fn options(&self) -> &HookOptions {
        &self.opts
    }

    fn matches(&self, ctx: &HookContext<'_>, message: &Message) -> bool {
        matches(&self.opts, Some(self), ctx, message)
    }

    fn handle(&self, _ctx: &HookContext<'_>, message: &Message) -> Result<Vec<Message>> {
        Ok(vec![self.trigger_message(message)])
    }
}
