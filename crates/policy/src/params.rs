//! Coercions over the untyped request params mapping. The on-wire values are
//! heterogeneous (strings, numbers, bools, arrays, CSV strings); every
//! accepted shape is explicit here.

use serde_json::{Map, Value};

/// Returns the value at `key` only when it is a JSON string.
pub fn get_string(params: &Map<String, Value>, key: &str) -> Option<String> {
    match params.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

/// First present string among `keys`, in order.
pub fn get_string_any(params: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| get_string(params, key))
}

/// Accepts JSON booleans and the literal strings `"true"`/`"false"`.
pub fn get_bool(params: &Map<String, Value>, key: &str) -> Option<bool> {
    match params.get(key) {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) if s == "true" => Some(true),
        Some(Value::String(s)) if s == "false" => Some(false),
        _ => None,
    }
}

/// Accepts integers, floats (truncated) and numeric strings.
pub fn get_i64(params: &Map<String, Value>, key: &str) -> Option<i64> {
    match params.get(key) {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        _ => None,
    }
}

/// Accepts a CSV string or an array of strings; blank items are dropped and
/// an empty result counts as absent.
pub fn get_string_list(params: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    match params.get(key)? {
        Value::String(s) => {
            let out: Vec<String> = s
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect();
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        }
        Value::Array(items) => {
            let out: Vec<String> = items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect();
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        }
        _ => None,
    }
}
