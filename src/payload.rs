//! Message payloads
//!
//! A payload is shared between the message that carried it and every
//! message derived from it until somebody writes to it. Reads go through
//! [`Payload::current`]; writes clone the underlying map only when it is
//! still shared.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

use crate::deep;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Arc<Map<String, JsonValue>>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, JsonValue>) -> Self {
        Self(Arc::new(map))
    }

    /// Non-object values land in `ret`
    pub fn from_value(value: JsonValue) -> Self {
        match value {
            JsonValue::Object(map) => Self::from_map(map),
            JsonValue::Null => Self::new(),
            other => {
                let mut map = Map::new();
                map.insert("ret".to_string(), other);
                Self::from_map(map)
            }
        }
    }

    /// In-place read
    pub fn current(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    /// Detached copy, safe to mutate without affecting other holders
    pub fn copy_current(&self) -> Map<String, JsonValue> {
        (*self.0).clone()
    }

    fn make_mut(&mut self) -> &mut Map<String, JsonValue> {
        Arc::make_mut(&mut self.0)
    }

    pub fn ret(&self) -> Option<&JsonValue> {
        self.0.get("ret")
    }

    pub fn set_ret(&mut self, value: JsonValue) {
        self.make_mut().insert("ret".to_string(), value);
    }

    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        deep::deep_get_map(&self.0, path)
    }

    pub fn set(&mut self, path: &str, value: JsonValue) -> bool {
        let mut root = JsonValue::Object(std::mem::take(self.make_mut()));
        let ok = deep::deep_set(&mut root, path, value);
        if let JsonValue::Object(map) = root {
            *self.make_mut() = map;
        }
        ok
    }

    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) {
        self.make_mut().insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<JsonValue> {
        if !self.0.contains_key(key) {
            return None;
        }
        self.make_mut().remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether two payloads still share the same storage
    pub fn ptr_eq(&self, other: &Payload) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn to_value(&self) -> JsonValue {
        JsonValue::Object(self.copy_current())
    }
}
