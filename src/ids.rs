//! Identifier helpers
//!
//! - exid: `<domain>-<unit>-<YYYYMMDD>.<HHMM>.<suffix>`
//! - nid: `_`-joined child indexes from the root (`0_1_2`), each segment
//!   optionally carrying a `-<sub>` counter (`0_1-3_0`) for function
//!   applications and trap handler runs
//! - fei: `<exid>-<nid>`

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

/* ===================== Patterns ===================== */

fn domain_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.\-]*$").expect("static regex"))
}

fn exid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([a-zA-Z0-9][a-zA-Z0-9_.\-]*)-([a-zA-Z0-9_.]+)-(\d{8}\.\d{4}\.[a-z]+)$")
            .expect("static regex")
    })
}

fn nid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+(?:-\d+)?(?:_\d+(?:-\d+)?)*$").expect("static regex"))
}

/* ===================== Domains & Exids ===================== */

/// Whether `s` could be a domain name (`org.acme`, `test`, `x.y-z`)
pub fn is_domain_name(s: &str) -> bool {
    domain_regex().is_match(s)
}

/// Splits a dotted flow path into `(domain, flow name)`
///
/// Returns None for anything that does not look like a flow path, so that
/// raw sources fall through to the parser.
pub fn split_flow_name(s: &str) -> Option<(String, String)> {
    if s.contains('\n') || !s.contains('.') || !is_domain_name(s) {
        return None;
    }

    let (domain, name) = s.rsplit_once('.')?;
    if domain.is_empty() || name.is_empty() {
        return None;
    }

    Some((domain.to_string(), name.to_string()))
}

/// Generates a new execution id for the given domain and unit
pub fn generate_exid(domain: &str, unit: &str) -> String {
    generate_exid_at(domain, unit, Utc::now())
}

pub fn generate_exid_at(domain: &str, unit: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}.{}",
        domain,
        unit,
        at.format("%Y%m%d.%H%M"),
        letter_suffix()
    )
}

/// 12 lowercase letters derived from a v4 uuid
fn letter_suffix() -> String {
    Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(12)
        .map(|b| (b'a' + b % 26) as char)
        .collect()
}

/// Extracts the domain part of an exid, None if the exid is malformed
pub fn exid_domain(exid: &str) -> Option<&str> {
    exid_regex()
        .captures(exid)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Full execution identifier of a node
pub fn fei(exid: &str, nid: &str) -> String {
    format!("{}-{}", exid, nid)
}

/* ===================== Nids ===================== */

pub fn is_nid(s: &str) -> bool {
    nid_regex().is_match(s)
}

/// Structural parent of a nid, None for a root segment
pub fn parent_id(nid: &str) -> Option<String> {
    nid.rsplit_once('_').map(|(parent, _)| parent.to_string())
}

/// Index of the node among its parent's children (sub counter ignored)
pub fn child_id(nid: &str) -> usize {
    let last = nid.rsplit('_').next().unwrap_or(nid);
    let last = last.split('-').next().unwrap_or(last);
    last.parse().unwrap_or(0)
}

/// The nid with the sub counter of its last segment stripped
pub fn master_nid(nid: &str) -> &str {
    let last_start = nid.rfind('_').map(|i| i + 1).unwrap_or(0);
    match nid[last_start..].find('-') {
        Some(dash) => &nid[..last_start + dash],
        None => nid,
    }
}

/// Child nid of `nid` at `index`
pub fn child_nid(nid: &str, index: usize) -> String {
    format!("{}_{}", nid, index)
}

/// Sub nid for a function application or trap handler run
pub fn sub_nid(nid: &str, sub: u64) -> String {
    format!("{}-{}", master_nid(nid), sub)
}

fn segments(nid: &str) -> impl Iterator<Item = &str> {
    nid.split('_').map(|seg| seg.split('-').next().unwrap_or(seg))
}

/// Whether `nid` lies in the subtree rooted at `ancestor`
///
/// Comparison is structural: sub counters are ignored, so handler runs
/// (`0_1-2_0`) count as descendants of the node that spawned them (`0_1`).
pub fn is_descendant_of(nid: &str, ancestor: &str, include_self: bool) -> bool {
    let mut nid_segs = segments(nid);
    for seg in segments(ancestor) {
        match nid_segs.next() {
            Some(s) if s == seg => continue,
            _ => return false,
        }
    }
    include_self || nid_segs.next().is_some()
}
