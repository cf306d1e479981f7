//! Dotted-path access into JSON values
//!
//! `a.b.1` walks object keys and array indexes. Array segments also accept
//! negative indexes (`-1` is the last element) and the aliases `first` and
//! `last`.

use serde_json::{Map, Value as JsonValue};

fn array_index(len: usize, seg: &str) -> Option<usize> {
    match seg {
        "first" => (len > 0).then_some(0),
        "last" => len.checked_sub(1),
        _ => {
            let i: i64 = seg.parse().ok()?;
            let i = if i < 0 { len as i64 + i } else { i };
            (i >= 0 && (i as usize) < len).then_some(i as usize)
        }
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

/// Returns `(found, value)`; `found` is false as soon as a segment is absent
pub fn deep_get<'a>(value: &'a JsonValue, path: &str) -> (bool, Option<&'a JsonValue>) {
    let mut current = value;

    for seg in segments(path) {
        let next = match current {
            JsonValue::Object(map) => map.get(seg),
            JsonValue::Array(arr) => array_index(arr.len(), seg).and_then(|i| arr.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return (false, None),
        }
    }

    (true, Some(current))
}

/// Convenience over [`deep_get`] for object roots
pub fn deep_get_map<'a>(map: &'a Map<String, JsonValue>, path: &str) -> Option<&'a JsonValue> {
    let mut segs = segments(path);
    let first = segs.next()?;
    let head = map.get(first)?;
    let rest: Vec<&str> = segs.collect();

    if rest.is_empty() {
        return Some(head);
    }
    deep_get(head, &rest.join(".")).1
}

pub fn deep_has_key(value: &JsonValue, path: &str) -> bool {
    deep_get(value, path).0
}

/// Sets the value at `path`, creating intermediate objects as needed
///
/// Returns false when an intermediate segment exists but is neither an
/// object nor an array, or when an array index is out of range.
pub fn deep_set(value: &mut JsonValue, path: &str, new_value: JsonValue) -> bool {
    let segs: Vec<&str> = segments(path).collect();
    let Some((last, init)) = segs.split_last() else {
        return false;
    };

    let mut current = value;
    for seg in init {
        current = match current {
            JsonValue::Object(map) => map
                .entry(seg.to_string())
                .or_insert_with(|| JsonValue::Object(Map::new())),
            JsonValue::Array(arr) => match array_index(arr.len(), seg) {
                Some(i) => &mut arr[i],
                None => return false,
            },
            _ => return false,
        };
    }

    match current {
        JsonValue::Object(map) => {
            map.insert(last.to_string(), new_value);
            true
        }
        JsonValue::Array(arr) => match array_index(arr.len(), last) {
            Some(i) => {
                arr[i] = new_value;
                true
            }
            None => false,
        },
        _ => false,
    }
}
