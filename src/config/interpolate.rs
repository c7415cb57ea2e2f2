//! Resource reference interpolation.
//!
//! Resource configurations may embed `${resources.<type>.<name>.id}` to refer
//! to the remote identifier of another resource of the same bundle. Each such
//! reference is also a dependency edge.

use serde_json::Value;

use crate::error::{PlanError, Result};
use crate::state::ResourceKey;

const REF_OPEN: &str = "${resources.";
const REF_CLOSE: char = '}';
const REF_FIELD: &str = ".id";

/// One reference occurrence inside a string.
struct Occurrence {
    start: usize,
    end: usize,
    key: ResourceKey,
}

/// Scans a string for well-formed references.
fn scan(s: &str) -> Vec<Occurrence> {
    let mut found = Vec::new();
    let mut offset = 0;

    while let Some(pos) = s[offset..].find(REF_OPEN) {
        let start = offset + pos;
        let body_start = start + REF_OPEN.len();
        let Some(close) = s[body_start..].find(REF_CLOSE) else {
            break;
        };
        let end = body_start + close + 1;
        let body = &s[body_start..body_start + close];

        if let Some(key) = body
            .strip_suffix(REF_FIELD)
            .and_then(|k| k.parse::<ResourceKey>().ok())
        {
            found.push(Occurrence { start, end, key });
        }
        offset = end;
    }

    found
}

/// Collects every resource referenced anywhere in `value`, in document order.
#[must_use]
pub fn find_references(value: &Value) -> Vec<ResourceKey> {
    let mut refs = Vec::new();
    collect(value, &mut refs);
    refs
}

fn collect(value: &Value, refs: &mut Vec<ResourceKey>) {
    match value {
        Value::String(s) => {
            for occurrence in scan(s) {
                if !refs.contains(&occurrence.key) {
                    refs.push(occurrence.key);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect(v, refs)),
        Value::Object(map) => map.values().for_each(|v| collect(v, refs)),
        _ => {}
    }
}

/// Replaces every reference in `value` with the remote id returned by `resolve`.
///
/// # Errors
///
/// Returns [`PlanError::UnknownReference`] if a referenced resource has no remote id.
pub fn substitute_references<F>(from: &ResourceKey, value: &Value, resolve: &F) -> Result<Value>
where
    F: Fn(&ResourceKey) -> Option<String>,
{
    match value {
        Value::String(s) => {
            let occurrences = scan(s);
            if occurrences.is_empty() {
                return Ok(value.clone());
            }

            let mut out = String::with_capacity(s.len());
            let mut last = 0;
            for occurrence in occurrences {
                let id = resolve(&occurrence.key).ok_or_else(|| PlanError::UnknownReference {
                    from: from.to_string(),
                    to: occurrence.key.to_string(),
                })?;
                out.push_str(&s[last..occurrence.start]);
                out.push_str(&id);
                last = occurrence.end;
            }
            out.push_str(&s[last..]);
            Ok(Value::String(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| substitute_references(from, v, resolve))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute_references(from, v, resolve)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}
