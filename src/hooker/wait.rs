use anyhow::Result;
use std::sync::Mutex;
use tokio::sync::oneshot;

use super::{HookContext, HookOptions, Observer};
use crate::types::{Message, Point};

/// `"terminated"`, `"0_1 receive"`, `"0_1 receive, terminated"`
///
/// Entries are awaited in order. A `failed` message ends any wait.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitSpec {
    entries: Vec<(Option<String>, Point)>,
}

impl WaitSpec {
    pub fn parse(s: &str) -> Option<Self> {
        let mut entries = Vec::new();

        for part in s.split([',', ';']).map(str::trim).filter(|p| !p.is_empty()) {
            let words: Vec<&str> = part.split_whitespace().collect();
            let entry = match words.as_slice() {
                [point] => (None, Point::parse(point)?),
                [nid, point] => (Some(nid.to_string()), Point::parse(point)?),
                _ => return None,
            };
            entries.push(entry);
        }

        (!entries.is_empty()).then_some(Self { entries })
    }

    pub fn terminated() -> Self {
        Self {
            entries: vec![(None, Point::Terminated)],
        }
    }
}

impl Default for WaitSpec {
    fn default() -> Self {
        Self::terminated()
    }
}

struct WaitState {
    remaining: Vec<(Option<String>, Point)>,
    sender: Option<oneshot::Sender<Message>>,
}

/// Structured hook resolving a caller's `wait` on one execution
pub struct WaitList {
    opts: HookOptions,
    state: Mutex<WaitState>,
}

impl WaitList {
    pub fn new(exid: impl Into<String>, spec: WaitSpec) -> (Self, oneshot::Receiver<Message>) {
        let (tx, rx) = oneshot::channel();
        let list = Self {
            opts: HookOptions::new().exid(exid).consumed(true),
            state: Mutex::new(WaitState {
                remaining: spec.entries,
                sender: Some(tx),
            }),
        };
        (list, rx)
    }
}

impl Observer for WaitList {
    fn options(&self) -> &HookOptions {
        &self.opts
    }

    fn handle(&self, _ctx: &HookContext<'_>, message: &Message) -> Result<Vec<Message>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("wait list lock poisoned"))?;

        if state.sender.is_none() {
            return Ok(Vec::new());
        }

        let done = if message.point == Point::Failed {
            true
        } else {
            let hit = state.remaining.first().is_some_and(|(nid, point)| {
                *point == message.point && nid.as_ref().map_or(true, |n| *n == message.nid)
            });
            if hit {
                state.remaining.remove(0);
            }
            state.remaining.is_empty()
        };

        if done {
            if let Some(tx) = state.sender.take() {
                // the waiter may have given up already
                let _ = tx.send(message.clone());
            }
        }

        Ok(Vec::new())
    }

    fn is_done(&self) -> bool {
        self.state.lock().map(|s| s.sender.is_none()).unwrap_or(true)
    }
}
