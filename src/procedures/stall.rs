use anyhow::Result;

use super::{Ctx, Procedure};
use crate::types::Message;

/// Never replies on its own, only a cancel ends it
pub struct Stall;

impl Procedure for Stall {
    fn receive_last_att(&self, _ctx: &mut Ctx, _ncid: usize) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }
}
