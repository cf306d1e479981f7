//! `$(...)` interpolation
//!
//! - `$(x)` looks `x` up through [`Node::lookup`]
//! - `$(nid)`, `$(exid)`, `$(tstamp)` are built in
//! - `$(a||b)` falls back to `b` when `a` is null or empty
//! - `$('text)` is a literal
//! - placeholders nest: `$(f.$(key))`
//!
//! A string made of a single placeholder expands to the raw value, anything
//! else expands to a string.

use anyhow::Result;
use chrono::Utc;
use serde_json::Value as JsonValue;

use super::Node;

impl<'a> Node<'a> {
    pub fn expand(&self, s: &str) -> Result<JsonValue> {
        if !s.contains("$(") {
            return Ok(JsonValue::String(s.to_string()));
        }

        if let Some(inner) = whole_placeholder(s) {
            let key = self.expand_to_string(inner)?;
            return self.resolve(&key);
        }

        Ok(JsonValue::String(self.expand_to_string(s)?))
    }

    fn expand_to_string(&self, s: &str) -> Result<String> {
        let mut out = String::with_capacity(s.len());
        let mut rest = s;

        while let Some(start) = rest.find("$(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];

            match matching_paren(after) {
                Some(end) => {
                    let key = self.expand_to_string(&after[..end])?;
                    out.push_str(&to_text(&self.resolve(&key)?));
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }

        out.push_str(rest);
        Ok(out)
    }

    fn resolve(&self, key: &str) -> Result<JsonValue> {
        for alt in key.split("||") {
            let alt = alt.trim();
            let value = match alt {
                "nid" => Some(JsonValue::String(self.nid().to_string())),
                "exid" => Some(JsonValue::String(self.exid().to_string())),
                "tstamp" => Some(JsonValue::String(
                    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
                )),
                lit if lit.starts_with('\'') => Some(JsonValue::String(lit[1..].to_string())),
                k => self.lookup(k)?,
            };
            match value {
                None | Some(JsonValue::Null) => continue,
                Some(JsonValue::String(s)) if s.is_empty() => continue,
                Some(v) => return Ok(v),
            }
        }
        Ok(JsonValue::Null)
    }
}

/// Byte offset of the `)` closing a placeholder whose body starts at `s[0]`
fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' if depth == 0 => return Some(i),
            ')' => depth -= 1,
            _ => {}
        }
    }
    None
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let body = s.strip_prefix("$(")?;
    let end = matching_paren(body)?;
    (end == body.len() - 1).then(|| &body[..end])
}

fn to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
