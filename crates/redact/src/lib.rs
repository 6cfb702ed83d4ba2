//! Response redaction: walks the upstream JSON tree dropping disallowed
//! keys, masking URLs and off-allowlist email addresses, then applies
//! action-specific collection filters keyed by the request's outward action.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use warden_policy::{GmailPolicy, Policy};

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("url pattern compiles"));
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[A-Z0-9._%+-]+@([A-Z0-9.-]+\.[A-Z]{2,})").expect("email pattern compiles")
});

const ALWAYS_DROP_KEYS: &[&str] = &["attachment", "attachments"];
const SNIPPET_KEYS: &[&str] = &["snippetHtml", "snippet_html"];
const BODY_KEYS: &[&str] = &[
    "body", "payload", "parts", "raw", "html", "htmlbody", "mime", "mimeType",
];
const CALENDAR_DETAIL_KEYS: &[&str] = &[
    "hangoutLink",
    "conferenceData",
    "location",
    "description",
    "htmlLink",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedactError {
    message: String,
}

impl RedactError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RedactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RedactError {}

/// Redacts `data` for `action` under `policy`. Warnings record every dropped
/// key, masked string and filtered collection. Unknown actions pass through
/// untouched.
pub fn redact(
    action: &str,
    data: Value,
    policy: &Policy,
) -> Result<(Value, Vec<String>), RedactError> {
    let mut warnings = Vec::new();
    match action {
        "gmail.search" | "gmail.thread.list" | "gmail.thread.get" | "gmail.thread.modify"
        | "gmail.get" | "gmail.send" | "gmail.drafts.create" | "gmail.labels.list"
        | "gmail.labels.get" | "gmail.labels.modify" => {
            let Some(gmail) = &policy.gmail else {
                return Err(RedactError::new("gmail policy missing"));
            };
            let clean = redact_value(data, policy, &mut warnings);
            let read_allowed = &gmail.allowed_read_labels;
            match action {
                "gmail.search" | "gmail.thread.list" => {
                    if !read_allowed.is_empty() {
                        let filtered =
                            filter_search_results(clean, read_allowed, policy, &mut warnings);
                        return Ok((filtered, warnings));
                    }
                }
                "gmail.labels.list" => {
                    let union = allowed_label_union(gmail);
                    if !union.is_empty() {
                        let filtered = filter_labels_list(clean, &union, &mut warnings);
                        return Ok((filtered, warnings));
                    }
                }
                // Sends and drafts carry no label info; skip label checks.
                "gmail.send" | "gmail.drafts.create" => return Ok((clean, warnings)),
                _ => {
                    if !read_allowed.is_empty() {
                        if let (true, false) = has_allowed_label_ids(&clean, read_allowed) {
                            return Err(RedactError::new(
                                "response does not include allowed labels",
                            ));
                        }
                    }
                }
            }
            Ok((clean, warnings))
        }
        "calendar.list" | "calendar.events" | "calendar.freebusy" => {
            let Some(calendar) = &policy.calendar else {
                return Err(RedactError::new("calendar policy missing"));
            };
            let clean = redact_value(data, policy, &mut warnings);
            if action == "calendar.list" && !calendar.allowed_calendars.is_empty() {
                let filtered =
                    filter_calendar_list(clean, &calendar.allowed_calendars, &mut warnings);
                return Ok((filtered, warnings));
            }
            Ok((clean, warnings))
        }
        _ => Ok((data, warnings)),
    }
}

fn redact_value(value: Value, policy: &Policy, warnings: &mut Vec<String>) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                if should_drop_key(&key, policy) {
                    warnings.push(format!("redacted:{key}"));
                    continue;
                }
                out.insert(key, redact_value(item, policy, warnings));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| redact_value(item, policy, warnings))
                .collect(),
        ),
        Value::String(s) => {
            let clean = sanitize_string(&s, policy);
            if clean != s {
                warnings.push("redacted:string".to_string());
            }
            Value::String(clean)
        }
        other => other,
    }
}

fn sanitize_string(input: &str, policy: &Policy) -> String {
    let mut output = input.to_string();
    if let Some(gmail) = &policy.gmail {
        if !gmail.allow_links {
            output = URL_RE.replace_all(&output, "[redacted]").into_owned();
        }
        if !gmail.allowed_senders.is_empty() {
            output = mask_emails(&output, &gmail.allowed_senders);
        }
    }
    if let Some(calendar) = &policy.calendar {
        if !calendar.allow_details {
            output = URL_RE.replace_all(&output, "[redacted]").into_owned();
        }
    }
    output
}

fn should_drop_key(key: &str, policy: &Policy) -> bool {
    if ALWAYS_DROP_KEYS.contains(&key) || SNIPPET_KEYS.contains(&key) {
        return true;
    }
    if let Some(gmail) = &policy.gmail {
        if !gmail.allow_body && BODY_KEYS.contains(&key) {
            return true;
        }
    }
    if let Some(calendar) = &policy.calendar {
        if !calendar.allow_details && CALENDAR_DETAIL_KEYS.contains(&key) {
            return true;
        }
    }
    false
}

fn mask_emails(input: &str, allowed_domains: &[String]) -> String {
    let allowed: HashSet<String> = allowed_domains
        .iter()
        .map(|d| d.trim_start_matches('@').to_lowercase())
        .collect();
    EMAIL_RE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let domain = caps
                .get(1)
                .map(|m| m.as_str().to_lowercase())
                .unwrap_or_default();
            if allowed.contains(&domain) {
                caps[0].to_string()
            } else {
                "[redacted]".to_string()
            }
        })
        .into_owned()
}

/// Walks the tree looking for a `labelIds`/`label_ids` array. Returns
/// `(found_any, intersects_allowlist)`.
fn has_allowed_label_ids(value: &Value, allowed: &[String]) -> (bool, bool) {
    let set: HashSet<String> = allowed.iter().map(|l| l.to_lowercase()).collect();
    has_allowed_label_ids_inner(value, &set)
}

fn has_allowed_label_ids_inner(value: &Value, allowed: &HashSet<String>) -> (bool, bool) {
    match value {
        Value::Object(map) => {
            for (key, item) in map {
                if key.eq_ignore_ascii_case("labelIds") || key.eq_ignore_ascii_case("label_ids") {
                    if let Value::Array(labels) = item {
                        let mut found_any = false;
                        for label in labels {
                            if let Some(s) = label.as_str() {
                                found_any = true;
                                if allowed.contains(&s.to_lowercase()) {
                                    return (true, true);
                                }
                            }
                        }
                        if found_any {
                            return (true, false);
                        }
                    }
                }
                let (found, ok) = has_allowed_label_ids_inner(item, allowed);
                if found {
                    return (found, ok);
                }
            }
            (false, false)
        }
        Value::Array(items) => {
            for item in items {
                let (found, ok) = has_allowed_label_ids_inner(item, allowed);
                if found {
                    return (found, ok);
                }
            }
            (false, false)
        }
        _ => (false, false),
    }
}

fn filter_search_results(
    data: Value,
    allowed: &[String],
    policy: &Policy,
    warnings: &mut Vec<String>,
) -> Value {
    let Value::Object(mut root) = data else {
        return data;
    };
    let Some(Value::Array(items)) = root.get("threads") else {
        return Value::Object(root);
    };

    let before = items.len();
    let filtered: Vec<Value> = items
        .iter()
        .filter(|item| allowed_label_for_item(item, allowed, policy))
        .cloned()
        .collect();
    if filtered.len() != before {
        root.insert("threads".to_string(), Value::Array(filtered));
        warnings.push("filtered:labels".to_string());
    }
    Value::Object(root)
}

fn filter_labels_list(data: Value, allowed: &HashSet<String>, warnings: &mut Vec<String>) -> Value {
    let Value::Object(mut root) = data else {
        return data;
    };
    let Some(Value::Array(items)) = root.get("labels") else {
        return Value::Object(root);
    };

    let before = items.len();
    let filtered: Vec<Value> = items
        .iter()
        .filter(|item| {
            let Value::Object(entry) = item else {
                return false;
            };
            let id = entry.get("id").and_then(Value::as_str).unwrap_or("");
            let name = entry.get("name").and_then(Value::as_str).unwrap_or("");
            allowed.contains(&id.to_lowercase()) || allowed.contains(&name.to_lowercase())
        })
        .cloned()
        .collect();
    if filtered.len() != before {
        root.insert("labels".to_string(), Value::Array(filtered));
        warnings.push("filtered:labels".to_string());
    }
    Value::Object(root)
}

fn filter_calendar_list(data: Value, allowed: &[String], warnings: &mut Vec<String>) -> Value {
    let Value::Object(mut root) = data else {
        return data;
    };
    let Some(Value::Array(items)) = root.get("calendars") else {
        return Value::Object(root);
    };

    let allowed_set: HashSet<String> = allowed
        .iter()
        .map(|id| id.trim().to_lowercase())
        .filter(|id| !id.is_empty())
        .collect();
    let before = items.len();
    let filtered: Vec<Value> = items
        .iter()
        .filter(|item| {
            item.as_object()
                .and_then(|entry| entry.get("id"))
                .and_then(Value::as_str)
                .map(|id| allowed_set.contains(&id.to_lowercase()))
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if filtered.len() != before {
        root.insert("calendars".to_string(), Value::Array(filtered));
        warnings.push("filtered:calendars".to_string());
    }
    Value::Object(root)
}

/// Union of the three label allowlists, lowercased.
fn allowed_label_union(gmail: &GmailPolicy) -> HashSet<String> {
    gmail
        .allowed_read_labels
        .iter()
        .chain(&gmail.allowed_add_labels)
        .chain(&gmail.allowed_remove_labels)
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty())
        .collect()
}

fn allowed_label_for_item(item: &Value, allowed: &[String], policy: &Policy) -> bool {
    let labels = extract_labels(item);
    if labels.is_empty() {
        return false;
    }
    let mut allowed_set = HashSet::new();
    for label in allowed {
        let label = label.trim();
        if label.is_empty() {
            continue;
        }
        allowed_set.insert(label.to_lowercase());
        if let Some(name) = policy.label_name_for_id(label) {
            allowed_set.insert(name.to_lowercase());
        }
        if let Some(id) = policy.label_id_for_name(label) {
            allowed_set.insert(id.to_lowercase());
        }
    }
    labels
        .iter()
        .any(|label| allowed_set.contains(&label.to_lowercase()))
}

fn extract_labels(item: &Value) -> Vec<String> {
    let Value::Object(map) = item else {
        return Vec::new();
    };
    for key in ["labels", "labelIds", "label_ids"] {
        if let Some(Value::Array(values)) = map.get(key) {
            let labels: Vec<String> = values
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !labels.is_empty() {
                return labels;
            }
        }
    }
    Vec::new()
}
