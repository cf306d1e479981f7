//! Hook filter options
//!
//! Options arrive from Rust callers or from flow text (trap attributes), so
//! [`HookOptions::from_json`] is lenient: aliases are accepted, scalars are
//! promoted to one-element lists and unreadable entries are dropped.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::types::Point;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainPattern {
    Exact(String),
    /// Written `/pattern/`
    Regex(String),
}

impl DomainPattern {
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix('/').and_then(|r| r.strip_suffix('/')) {
            Some(re) if !re.is_empty() => DomainPattern::Regex(re.to_string()),
            _ => DomainPattern::Exact(s.to_string()),
        }
    }

    pub fn matches(&self, domain: &str) -> bool {
        match self {
            DomainPattern::Exact(d) => d == domain,
            DomainPattern::Regex(re) => Regex::new(re).map(|r| r.is_match(domain)).unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<Point>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<Vec<DomainPattern>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,
    /// Traps only: the target node must sit in the trap's subtree
    #[serde(default)]
    pub subnid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heaps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heats: Option<Vec<String>>,
    /// Traps only: also see messages coming from the trap's own subtree
    #[serde(default)]
    pub include_self: bool,
}

fn pick<'a>(map: &'a Map<String, JsonValue>, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter().find_map(|k| map.get(*k)).filter(|v| !v.is_null())
}

fn strings(value: &JsonValue) -> Option<Vec<String>> {
    let list: Vec<String> = match value {
        JsonValue::String(s) => vec![s.clone()],
        JsonValue::Array(a) => a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
        _ => return None,
    };
    (!list.is_empty()).then_some(list)
}

fn truthy(value: Option<&JsonValue>) -> bool {
    match value {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::String(s)) => matches!(s.as_str(), "true" | "yes" | "self"),
        _ => false,
    }
}

impl HookOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(value: &JsonValue) -> Self {
        let Some(map) = value.as_object() else {
            return Self::default();
        };

        let points = pick(map, &["point", "points", "p"])
            .and_then(strings)
            .map(|ps| ps.iter().filter_map(|p| Point::parse(p)).collect::<Vec<_>>())
            .filter(|ps| !ps.is_empty());

        Self {
            consumed: pick(map, &["consumed", "c"]).and_then(JsonValue::as_bool),
            points,
            exid: pick(map, &["exid"]).and_then(|v| v.as_str()).map(str::to_string),
            domains: pick(map, &["domain", "domains", "d"])
                .and_then(strings)
                .map(|ds| ds.iter().map(|d| DomainPattern::parse(d)).collect()),
            subdomains: pick(map, &["subdomain", "subdomains", "sd"]).and_then(strings),
            tags: pick(map, &["tag", "tags", "t"]).and_then(strings),
            names: pick(map, &["name", "names", "n"]).and_then(strings),
            subnid: truthy(pick(map, &["subnid"])),
            heaps: pick(map, &["heap", "heaps", "hp"]).and_then(strings),
            heats: pick(map, &["heat", "heats", "ht"]).and_then(strings),
            include_self: truthy(pick(map, &["self", "include_self"])),
        }
    }

    pub fn consumed(mut self, consumed: bool) -> Self {
        self.consumed = Some(consumed);
        self
    }

    pub fn points(mut self, points: impl IntoIterator<Item = Point>) -> Self {
        self.points = Some(points.into_iter().collect());
        self
    }

    pub fn exid(mut self, exid: impl Into<String>) -> Self {
        self.exid = Some(exid.into());
        self
    }

    pub fn domains(mut self, domains: &[&str]) -> Self {
        self.domains = Some(domains.iter().map(|d| DomainPattern::parse(d)).collect());
        self
    }

    pub fn subdomains(mut self, subdomains: &[&str]) -> Self {
        self.subdomains = Some(subdomains.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags = Some(tags.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn names(mut self, names: &[&str]) -> Self {
        self.names = Some(names.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn heaps(mut self, heaps: &[&str]) -> Self {
        self.heaps = Some(heaps.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn heats(mut self, heats: &[&str]) -> Self {
        self.heats = Some(heats.iter().map(|s| s.to_string()).collect());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_aliases_and_leniency() {
        let opts = HookOptions::from_json(&json!({
            "p": ["left", "nada", 3],
            "n": "foo",
            "d": ["org.acme", "/^com\\./"],
            "sd": "org",
            "hp": ["sequence"],
            "ht": 7,
            "c": true,
            "subnid": "yes"
        }));

        assert_eq!(opts.points, Some(vec![Point::Left]));
        assert_eq!(opts.names, Some(vec!["foo".to_string()]));
        assert_eq!(opts.subdomains, Some(vec!["org".to_string()]));
        assert_eq!(opts.heaps, Some(vec!["sequence".to_string()]));
        assert_eq!(opts.heats, None);
        assert_eq!(opts.consumed, Some(true));
        assert!(opts.subnid);
        assert!(!opts.include_self);

        let domains = opts.domains.unwrap();
        assert!(domains[0].matches("org.acme"));
        assert!(domains[1].matches("com.acme"));
        assert!(!domains[1].matches("org.com"));
    }

    #[test]
    fn test_from_json_on_garbage() {
        assert_eq!(HookOptions::from_json(&json!("nope")), HookOptions::default());
        assert_eq!(HookOptions::from_json(&json!({"point": ["nada"]})).points, None);
    }

    #[test]
    fn test_bad_regex_never_matches() {
        assert!(!DomainPattern::parse("/(/").matches("("));
    }
}
