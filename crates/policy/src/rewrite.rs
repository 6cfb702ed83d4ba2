//! The per-action rewrite table. Each rewriter owns its params
//! transformation: it validates required keys, rejects values outside the
//! account's allowlists, and rewrites parameters in place before the
//! upstream CLI ever sees them.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Map, Value};

use crate::params::{get_bool, get_i64, get_string, get_string_any, get_string_list};
use crate::{Policy, PolicyError};

static NEWER_THAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bnewer_than:(\d+)d").expect("newer_than pattern compiles"));
static AFTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bafter:(\d{4})/(\d{2})/(\d{2})").expect("after pattern compiles")
});

const TIME_PARAM_KEYS: &[&str] = &[
    "from",
    "to",
    "time_min",
    "time_max",
    "today",
    "tomorrow",
    "week",
    "days",
    "week_start",
];

#[derive(Debug, Clone, Copy)]
enum LabelMode {
    Read,
    Add,
    Remove,
}

impl LabelMode {
    fn as_str(self) -> &'static str {
        match self {
            LabelMode::Read => "read",
            LabelMode::Add => "add",
            LabelMode::Remove => "remove",
        }
    }
}

impl Policy {
    /// Validates and rewrites `params` for `action`. Returns the rewritten
    /// params plus provenance warnings for every applied rewrite. Errors are
    /// authorization failures.
    pub async fn validate_and_rewrite(
        &self,
        now: DateTime<Utc>,
        action: &str,
        mut params: Map<String, Value>,
    ) -> Result<(Map<String, Value>, Vec<String>), PolicyError> {
        let mut warnings = Vec::new();
        match action {
            "gmail.search" | "gmail.thread.list" => {
                self.rewrite_gmail_query(now, &mut params, &mut warnings)?
            }
            "gmail.thread.get" => rewrite_gmail_thread_get(&mut params)?,
            "gmail.thread.modify" => self.rewrite_gmail_thread_modify(&mut params)?,
            "gmail.get" => rewrite_gmail_get(&mut params, &mut warnings)?,
            "gmail.send" => self.rewrite_gmail_send(&mut params, &mut warnings)?,
            "gmail.drafts.create" => self.rewrite_gmail_draft_create(&mut params)?,
            "gmail.labels.list" => {}
            "gmail.labels.get" => self.rewrite_gmail_labels_get(&mut params)?,
            "gmail.labels.modify" => self.rewrite_gmail_labels_modify(&mut params)?,
            "calendar.list" => {}
            "calendar.events" => self.rewrite_calendar_events(now, &mut params).await?,
            "calendar.freebusy" => self.rewrite_calendar_freebusy(now, &mut params).await?,
            "policy.actions" => {
                if !params.is_empty() {
                    return Err(PolicyError::new("params must be empty"));
                }
            }
            other => return Err(PolicyError::new(format!("unsupported action: {other}"))),
        }
        Ok((params, warnings))
    }

    /// True when a `gmail.send` must be downgraded to a draft. The broker
    /// substitutes `gmail.drafts.create` as the executed action.
    pub fn draft_send_required(&self, params: &Map<String, Value>) -> bool {
        self.draft_send_reason(params).is_some()
    }

    fn rewrite_gmail_query(
        &self,
        now: DateTime<Utc>,
        params: &mut Map<String, Value>,
        warnings: &mut Vec<String>,
    ) -> Result<(), PolicyError> {
        let mut query = get_string(params, "query")
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| PolicyError::new("params.query is required"))?;

        if let Some(gmail) = &self.gmail {
            if gmail.max_days > 0 {
                if let Some(days) = extract_newer_than_days(&query) {
                    if days > gmail.max_days {
                        return Err(PolicyError::new(format!(
                            "query newer_than exceeds max_days ({})",
                            gmail.max_days
                        )));
                    }
                } else if let Some(after) = extract_after_date(&query) {
                    let limit = now - Duration::days(gmail.max_days);
                    if after < limit {
                        return Err(PolicyError::new(format!(
                            "query after date exceeds max_days ({})",
                            gmail.max_days
                        )));
                    }
                } else {
                    query = format!("{query} newer_than:{}d", gmail.max_days)
                        .trim()
                        .to_string();
                    warnings.push("query_rewritten:newer_than".to_string());
                }
            }

            if !gmail.allowed_senders.is_empty() {
                query = append_sender_restriction(&query, &gmail.allowed_senders);
                warnings.push("query_rewritten:sender_restriction".to_string());
            }
        }

        params.insert("query".to_string(), Value::String(query));
        Ok(())
    }

    fn rewrite_gmail_thread_modify(
        &self,
        params: &mut Map<String, Value>,
    ) -> Result<(), PolicyError> {
        let thread_id = get_string_any(params, &["thread_id", "id"])
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PolicyError::new("params.thread_id is required"))?;

        let add = get_string_list(params, "add").unwrap_or_default();
        let remove = get_string_list(params, "remove").unwrap_or_default();
        if add.is_empty() && remove.is_empty() {
            return Err(PolicyError::new("params.add or params.remove is required"));
        }
        self.validate_labels(&add, LabelMode::Add, false)?;
        self.validate_labels(&remove, LabelMode::Remove, false)?;

        params.remove("id");
        params.insert("thread_id".to_string(), Value::String(thread_id));
        if !add.is_empty() {
            params.insert("add".to_string(), Value::String(add.join(",")));
        }
        if !remove.is_empty() {
            params.insert("remove".to_string(), Value::String(remove.join(",")));
        }
        Ok(())
    }

    fn rewrite_gmail_send(
        &self,
        params: &mut Map<String, Value>,
        warnings: &mut Vec<String>,
    ) -> Result<(), PolicyError> {
        let gmail = self
            .gmail
            .as_ref()
            .ok_or_else(|| PolicyError::new("gmail policy missing"))?;

        if params.contains_key("track") || params.contains_key("track_split") {
            return Err(PolicyError::new("tracking is not allowed"));
        }
        if params.contains_key("reply_all") {
            return Err(PolicyError::new("reply_all is not allowed"));
        }
        if params.contains_key("thread_id") && gmail.draft_only {
            return Err(PolicyError::new(
                "thread_id is not supported in draft_only mode",
            ));
        }
        if params.contains_key("attach") && !gmail.allow_attachments {
            return Err(PolicyError::new("attachments are not allowed"));
        }

        if let Some(reason) = self.draft_send_reason(params) {
            warnings.push(format!("draft_only:{reason}"));
        }
        Ok(())
    }

    fn rewrite_gmail_draft_create(
        &self,
        params: &mut Map<String, Value>,
    ) -> Result<(), PolicyError> {
        let gmail = self
            .gmail
            .as_ref()
            .ok_or_else(|| PolicyError::new("gmail policy missing"))?;

        if params.contains_key("track") || params.contains_key("track_split") {
            return Err(PolicyError::new("tracking is not allowed"));
        }
        if params.contains_key("reply_all") {
            return Err(PolicyError::new("reply_all is not allowed"));
        }
        if params.contains_key("thread_id") {
            return Err(PolicyError::new(
                "thread_id is not supported for draft creation",
            ));
        }
        if params.contains_key("attach") && !gmail.allow_attachments {
            return Err(PolicyError::new("attachments are not allowed"));
        }
        Ok(())
    }

    fn rewrite_gmail_labels_get(&self, params: &mut Map<String, Value>) -> Result<(), PolicyError> {
        let label = get_string_any(params, &["label", "label_id", "id"])
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .ok_or_else(|| PolicyError::new("params.label is required"))?;

        self.validate_labels(std::slice::from_ref(&label), LabelMode::Read, true)?;

        params.remove("label_id");
        params.remove("id");
        params.insert("label".to_string(), Value::String(label));
        Ok(())
    }

    fn rewrite_gmail_labels_modify(
        &self,
        params: &mut Map<String, Value>,
    ) -> Result<(), PolicyError> {
        let thread_ids = get_string_list(params, "thread_ids").or_else(|| {
            get_string_any(params, &["thread_id", "id"]).map(|tid| vec![tid])
        });
        let thread_ids = match thread_ids {
            Some(ids) if !ids.is_empty() => ids,
            _ => return Err(PolicyError::new("params.thread_ids is required")),
        };

        let add = get_string_list(params, "add").unwrap_or_default();
        let remove = get_string_list(params, "remove").unwrap_or_default();
        if add.is_empty() && remove.is_empty() {
            return Err(PolicyError::new("params.add or params.remove is required"));
        }
        self.validate_labels(&add, LabelMode::Add, false)?;
        self.validate_labels(&remove, LabelMode::Remove, false)?;

        params.remove("thread_id");
        params.remove("id");
        params.insert(
            "thread_ids".to_string(),
            Value::Array(thread_ids.into_iter().map(Value::String).collect()),
        );
        if !add.is_empty() {
            params.insert("add".to_string(), Value::String(add.join(",")));
        }
        if !remove.is_empty() {
            params.insert("remove".to_string(), Value::String(remove.join(",")));
        }
        Ok(())
    }

    async fn rewrite_calendar_events(
        &self,
        now: DateTime<Utc>,
        params: &mut Map<String, Value>,
    ) -> Result<(), PolicyError> {
        let calendar_id = get_string(params, "calendar_id")
            .ok_or_else(|| PolicyError::new("params.calendar_id is required"))?;
        if let Some(calendar) = &self.calendar {
            if !calendar.allowed_calendars.is_empty()
                && !calendar.allowed_calendars.iter().any(|c| c == &calendar_id)
            {
                return Err(PolicyError::new("calendar_id is not allowed"));
            }
        }
        self.resolve_calendar_range(now, params, false).await
    }

    async fn rewrite_calendar_freebusy(
        &self,
        now: DateTime<Utc>,
        params: &mut Map<String, Value>,
    ) -> Result<(), PolicyError> {
        self.resolve_calendar_range(now, params, true).await?;

        let calendar_ids = get_string_list(params, "calendar_ids")
            .ok_or_else(|| PolicyError::new("params.calendar_ids is required"))?;
        if let Some(calendar) = &self.calendar {
            if !calendar.allowed_calendars.is_empty() {
                for id in &calendar_ids {
                    if !calendar.allowed_calendars.iter().any(|c| c == id) {
                        return Err(PolicyError::new(
                            "calendar_ids contains disallowed calendar",
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolves the request's time selection into absolute RFC3339
    /// `time_min`/`time_max`, enforcing the calendar window. Purely absolute
    /// inputs skip the zone provider entirely.
    async fn resolve_calendar_range(
        &self,
        now: DateTime<Utc>,
        params: &mut Map<String, Value>,
        require: bool,
    ) -> Result<(), PolicyError> {
        let calendar = self
            .calendar
            .as_ref()
            .ok_or_else(|| PolicyError::new("calendar policy missing"))?;

        let mut flags = warden_timerange::Flags::default();
        flags.from = get_string_any(params, &["time_min", "from"]).filter(|s| !s.is_empty());
        flags.to = get_string_any(params, &["time_max", "to"]).filter(|s| !s.is_empty());
        if let Some(v) = get_bool(params, "today") {
            flags.today = v;
        }
        if let Some(v) = get_bool(params, "tomorrow") {
            flags.tomorrow = v;
        }
        if let Some(v) = get_bool(params, "week") {
            flags.week = v;
        }
        if let Some(v) = get_i64(params, "days") {
            flags.days = v;
        }
        flags.week_start = get_string(params, "week_start").filter(|s| !s.is_empty());

        let has_time_flags = flags.from.is_some()
            || flags.to.is_some()
            || flags.today
            || flags.tomorrow
            || flags.week
            || flags.days > 0;
        if require && !has_time_flags {
            return Err(PolicyError::new(
                "params.time_min and params.time_max are required",
            ));
        }

        let mut default_days = 7;
        if calendar.max_days > 0 && calendar.max_days < default_days {
            default_days = calendar.max_days;
        }
        let default_window = Duration::days(default_days);

        let needs_tz = flags.today
            || flags.tomorrow
            || flags.week
            || flags.days > 0
            || flags.from.is_none()
            || flags.to.is_none();
        if !needs_tz {
            let from_abs = flags.from.as_deref().and_then(parse_absolute_time);
            let to_abs = flags.to.as_deref().and_then(parse_absolute_time);
            if let (Some(from_abs), Some(to_abs)) = (from_abs, to_abs) {
                check_window(from_abs.into(), to_abs.into(), calendar.max_days)?;
                strip_time_params(params);
                params.insert(
                    "time_min".to_string(),
                    Value::String(from_abs.to_rfc3339_opts(SecondsFormat::Secs, true)),
                );
                params.insert(
                    "time_max".to_string(),
                    Value::String(to_abs.to_rfc3339_opts(SecondsFormat::Secs, true)),
                );
                return Ok(());
            }
            // Not both absolute after all; fall through to the zone resolver.
        }

        let provider = self
            .time_zone_provider()
            .ok_or_else(|| PolicyError::new("timezone provider not configured"))?;
        let tz = provider.time_zone().await?;

        let defaults = warden_timerange::Defaults {
            from_offset: Duration::zero(),
            to_offset: default_window,
            to_from_offset: default_window,
        };
        let range = warden_timerange::resolve(now, tz, &flags, defaults)
            .map_err(|err| PolicyError::new(err.to_string()))?;
        check_window(
            range.from.with_timezone(&Utc),
            range.to.with_timezone(&Utc),
            calendar.max_days,
        )?;

        strip_time_params(params);
        params.insert(
            "time_min".to_string(),
            Value::String(range.from.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        params.insert(
            "time_max".to_string(),
            Value::String(range.to.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        Ok(())
    }

    fn validate_labels(
        &self,
        labels: &[String],
        mode: LabelMode,
        allow_empty: bool,
    ) -> Result<(), PolicyError> {
        if labels.is_empty() {
            return Ok(());
        }
        let gmail = self
            .gmail
            .as_ref()
            .ok_or_else(|| PolicyError::new("gmail policy missing"))?;
        let allowed = match mode {
            LabelMode::Read => &gmail.allowed_read_labels,
            LabelMode::Add => &gmail.allowed_add_labels,
            LabelMode::Remove => &gmail.allowed_remove_labels,
        };
        if allowed.is_empty() {
            if allow_empty {
                return Ok(());
            }
            return Err(PolicyError::new(format!(
                "no labels allowed for {}",
                mode.as_str()
            )));
        }
        for label in labels {
            let label = label.trim();
            if label.is_empty() {
                continue;
            }
            if !self.is_label_allowed(label, allowed) {
                return Err(PolicyError::new(format!("label not allowed: {label}")));
            }
        }
        Ok(())
    }

    /// Case-insensitive label check accepting the literal string, its mapped
    /// display name, or its mapped id.
    fn is_label_allowed(&self, label: &str, allowed: &[String]) -> bool {
        let allowed_set: HashSet<String> = allowed
            .iter()
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .collect();
        if allowed_set.is_empty() {
            return false;
        }
        if allowed_set.contains(&label.to_lowercase()) {
            return true;
        }
        if let Some(id) = self.label_id_for_name(label) {
            if allowed_set.contains(&id.to_lowercase()) {
                return true;
            }
        }
        if let Some(name) = self.label_name_for_id(label) {
            if allowed_set.contains(&name.to_lowercase()) {
                return true;
            }
        }
        false
    }

    fn draft_send_reason(&self, params: &Map<String, Value>) -> Option<&'static str> {
        let gmail = self.gmail.as_ref()?;
        if gmail.draft_only {
            return Some("policy");
        }
        if gmail.allowed_send_recipients.is_empty() {
            return None;
        }
        let Some(recipients) = collect_recipients(params) else {
            return Some("recipients_missing");
        };
        if !recipients_allowed(&recipients, &gmail.allowed_send_recipients) {
            return Some("recipient_not_allowed");
        }
        None
    }
}

fn rewrite_gmail_thread_get(params: &mut Map<String, Value>) -> Result<(), PolicyError> {
    if let Some(val) = get_string(params, "id") {
        params.remove("id");
        params.insert("thread_id".to_string(), Value::String(val));
        return Ok(());
    }
    if get_string(params, "thread_id").is_some() {
        return Ok(());
    }
    Err(PolicyError::new("params.id or params.thread_id is required"))
}

fn rewrite_gmail_get(
    params: &mut Map<String, Value>,
    warnings: &mut Vec<String>,
) -> Result<(), PolicyError> {
    if let Some(val) = get_string(params, "id") {
        params.remove("id");
        params.insert("message_id".to_string(), Value::String(val));
    } else if get_string(params, "message_id").is_none() {
        return Err(PolicyError::new("params.id or params.message_id is required"));
    }

    if let Some(format) = get_string(params, "format") {
        if !format.is_empty() && format != "metadata" {
            return Err(PolicyError::new("format must be metadata"));
        }
    }
    params.insert("format".to_string(), Value::String("metadata".to_string()));

    if params.remove("headers").is_some() {
        warnings.push("headers_ignored:default".to_string());
    }
    Ok(())
}

fn check_window(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    max_days: i64,
) -> Result<(), PolicyError> {
    if to < from {
        return Err(PolicyError::new("params.time_max must be after time_min"));
    }
    if max_days > 0 && (to - from) > Duration::days(max_days) {
        return Err(PolicyError::new("calendar range exceeds max_days"));
    }
    Ok(())
}

fn strip_time_params(params: &mut Map<String, Value>) {
    for key in TIME_PARAM_KEYS {
        params.remove(*key);
    }
}

fn parse_absolute_time(val: &str) -> Option<DateTime<FixedOffset>> {
    let val = val.trim();
    if val.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(val) {
        return Some(t);
    }
    DateTime::parse_from_str(val, "%Y-%m-%dT%H:%M:%S%z").ok()
}

fn extract_newer_than_days(query: &str) -> Option<i64> {
    NEWER_THAN_RE
        .captures(query)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
}

fn extract_after_date(query: &str) -> Option<DateTime<Utc>> {
    let caps = AFTER_RE.captures(query)?;
    let year = caps.get(1)?.as_str().parse::<i32>().ok()?;
    let month = caps.get(2)?.as_str().parse::<u32>().ok()?;
    let day = caps.get(3)?.as_str().parse::<u32>().ok()?;
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(DateTime::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0)?,
        Utc,
    ))
}

fn append_sender_restriction(query: &str, senders: &[String]) -> String {
    let parts: Vec<String> = senders
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.starts_with('@') {
                format!("from:{s}")
            } else {
                format!("from:@{s}")
            }
        })
        .collect();
    if parts.is_empty() {
        return query.to_string();
    }
    format!("{query} ({})", parts.join(" OR ")).trim().to_string()
}

fn collect_recipients(params: &Map<String, Value>) -> Option<Vec<String>> {
    let mut recipients = Vec::new();
    for key in ["to", "cc", "bcc"] {
        match params.get(key) {
            Some(Value::String(s)) => recipients.extend(split_recipients(s)),
            Some(Value::Array(items)) => {
                for item in items {
                    if let Some(s) = item.as_str() {
                        recipients.extend(split_recipients(s));
                    }
                }
            }
            _ => {}
        }
    }
    if recipients.is_empty() {
        None
    } else {
        Some(recipients)
    }
}

/// Splits a comma-separated recipient list, extracting the bare address from
/// `Name <addr>` forms. Unparseable items pass through lowercased so the
/// allowlist comparison still sees them.
fn split_recipients(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| parse_address(part).unwrap_or_else(|| part.to_lowercase()))
        .collect()
}

fn parse_address(part: &str) -> Option<String> {
    let candidate = match (part.rfind('<'), part.rfind('>')) {
        (Some(start), Some(end)) if start < end => part[start + 1..end].trim(),
        _ => part,
    };
    let (local, domain) = candidate.split_once('@')?;
    if local.is_empty()
        || domain.is_empty()
        || domain.contains('@')
        || candidate.contains(char::is_whitespace)
    {
        return None;
    }
    Some(candidate.to_lowercase())
}

fn recipients_allowed(recipients: &[String], allowed: &[String]) -> bool {
    let allowed_set: HashSet<String> = allowed
        .iter()
        .map(|a| a.trim().to_lowercase())
        .filter(|a| !a.is_empty())
        .collect();
    recipients
        .iter()
        .all(|rcpt| allowed_set.contains(&rcpt.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CalendarPolicy, GmailPolicy, TimeZoneProvider};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct FixedZone(chrono_tz::Tz);

    #[async_trait]
    impl TimeZoneProvider for FixedZone {
        async fn time_zone(&self) -> Result<chrono_tz::Tz, PolicyError> {
            Ok(self.0)
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0)
            .single()
            .expect("fixed instant should exist")
    }

    fn gmail_policy(actions: &[&str], gmail: GmailPolicy) -> Policy {
        let mut policy = Policy::new(
            actions.iter().map(|a| a.to_string()).collect(),
            Some(gmail),
            None,
        );
        policy.validate().expect("policy should validate");
        policy
    }

    fn calendar_policy(calendar: CalendarPolicy) -> Policy {
        let mut policy = Policy::new(
            vec!["calendar.events".to_string(), "calendar.freebusy".to_string()],
            None,
            Some(calendar),
        );
        policy.validate().expect("policy should validate");
        policy
    }

    fn obj(value: Value) -> Map<String, Value> {
        value
            .as_object()
            .cloned()
            .expect("fixture should be an object")
    }

    #[tokio::test]
    async fn gmail_query_appends_newer_than() {
        let policy = gmail_policy(
            &["gmail.search"],
            GmailPolicy {
                max_days: 7,
                allowed_read_labels: vec!["Label_123".to_string()],
                ..GmailPolicy::default()
            },
        );
        let (out, warnings) = policy
            .validate_and_rewrite(now(), "gmail.search", obj(json!({"query": "label:Label_123"})))
            .await
            .expect("rewrite should succeed");
        assert_eq!(
            out.get("query").and_then(Value::as_str),
            Some("label:Label_123 newer_than:7d")
        );
        assert!(warnings.contains(&"query_rewritten:newer_than".to_string()));
    }

    #[tokio::test]
    async fn gmail_query_enforces_window() {
        let policy = gmail_policy(
            &["gmail.search"],
            GmailPolicy {
                max_days: 7,
                ..GmailPolicy::default()
            },
        );

        // Inside the window passes unchanged.
        let (out, warnings) = policy
            .validate_and_rewrite(now(), "gmail.search", obj(json!({"query": "newer_than:3d x"})))
            .await
            .expect("rewrite should succeed");
        assert_eq!(out.get("query").and_then(Value::as_str), Some("newer_than:3d x"));
        assert!(warnings.is_empty());

        // Too-wide newer_than is rejected.
        let err = policy
            .validate_and_rewrite(now(), "gmail.search", obj(json!({"query": "newer_than:30d"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("newer_than exceeds max_days"));

        // Recent after: passes, ancient after: is rejected.
        policy
            .validate_and_rewrite(now(), "gmail.search", obj(json!({"query": "after:2024/05/12"})))
            .await
            .expect("recent after should pass");
        let err = policy
            .validate_and_rewrite(now(), "gmail.search", obj(json!({"query": "after:2024/01/01"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("after date exceeds max_days"));
    }

    #[tokio::test]
    async fn gmail_query_requires_query() {
        let policy = gmail_policy(&["gmail.search"], GmailPolicy::default());
        let err = policy
            .validate_and_rewrite(now(), "gmail.search", obj(json!({"query": "  "})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("params.query is required"));
    }

    #[tokio::test]
    async fn gmail_query_appends_sender_restriction() {
        let policy = gmail_policy(
            &["gmail.search"],
            GmailPolicy {
                allowed_senders: vec!["example.com".to_string(), "@corp.io".to_string()],
                ..GmailPolicy::default()
            },
        );
        let (out, warnings) = policy
            .validate_and_rewrite(now(), "gmail.search", obj(json!({"query": "is:unread"})))
            .await
            .expect("rewrite should succeed");
        assert_eq!(
            out.get("query").and_then(Value::as_str),
            Some("is:unread (from:@example.com OR from:@corp.io)")
        );
        assert!(warnings.contains(&"query_rewritten:sender_restriction".to_string()));
    }

    #[tokio::test]
    async fn gmail_thread_get_coerces_id() {
        let policy = gmail_policy(&["gmail.thread.get"], GmailPolicy::default());
        let (out, _) = policy
            .validate_and_rewrite(now(), "gmail.thread.get", obj(json!({"id": "t1"})))
            .await
            .expect("rewrite should succeed");
        assert_eq!(out.get("thread_id").and_then(Value::as_str), Some("t1"));
        assert!(!out.contains_key("id"));

        let err = policy
            .validate_and_rewrite(now(), "gmail.thread.get", Map::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("thread_id is required"));
    }

    #[tokio::test]
    async fn gmail_get_forces_metadata_and_drops_headers() {
        let policy = gmail_policy(&["gmail.get"], GmailPolicy::default());
        let (out, warnings) = policy
            .validate_and_rewrite(
                now(),
                "gmail.get",
                obj(json!({"message_id": "m1", "headers": "From,To"})),
            )
            .await
            .expect("rewrite should succeed");
        assert_eq!(out.get("format").and_then(Value::as_str), Some("metadata"));
        assert!(!out.contains_key("headers"));
        assert!(warnings.contains(&"headers_ignored:default".to_string()));

        let err = policy
            .validate_and_rewrite(
                now(),
                "gmail.get",
                obj(json!({"message_id": "m1", "format": "full"})),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("format must be metadata"));
    }

    #[tokio::test]
    async fn gmail_send_rejections() {
        let policy = gmail_policy(
            &["gmail.send"],
            GmailPolicy {
                draft_only: true,
                ..GmailPolicy::default()
            },
        );
        let err = policy
            .validate_and_rewrite(
                now(),
                "gmail.send",
                obj(json!({"to": "a@b.com", "subject": "hi", "body": "yo", "thread_id": "t1"})),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("draft_only mode"));

        let policy = gmail_policy(&["gmail.send"], GmailPolicy::default());
        for key in ["track", "track_split"] {
            let err = policy
                .validate_and_rewrite(now(), "gmail.send", obj(json!({key: true})))
                .await
                .unwrap_err();
            assert!(err.to_string().contains("tracking is not allowed"));
        }
        let err = policy
            .validate_and_rewrite(now(), "gmail.send", obj(json!({"reply_all": true})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("reply_all is not allowed"));
        let err = policy
            .validate_and_rewrite(
                now(),
                "gmail.send",
                obj(json!({"to": "a@b.com", "attach": ["file.txt"]})),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("attachments are not allowed"));
    }

    #[tokio::test]
    async fn gmail_send_draft_substitution_reasons() {
        let policy = gmail_policy(
            &["gmail.send"],
            GmailPolicy {
                draft_only: true,
                ..GmailPolicy::default()
            },
        );
        let (_, warnings) = policy
            .validate_and_rewrite(now(), "gmail.send", obj(json!({"to": "a@b.com"})))
            .await
            .expect("rewrite should succeed");
        assert!(warnings.contains(&"draft_only:policy".to_string()));

        let policy = gmail_policy(
            &["gmail.send"],
            GmailPolicy {
                allowed_send_recipients: vec!["allowed@example.com".to_string()],
                ..GmailPolicy::default()
            },
        );
        let (_, warnings) = policy
            .validate_and_rewrite(
                now(),
                "gmail.send",
                obj(json!({"to": "other@example.com", "subject": "hi", "body": "yo"})),
            )
            .await
            .expect("rewrite should succeed");
        assert!(warnings.contains(&"draft_only:recipient_not_allowed".to_string()));

        let (_, warnings) = policy
            .validate_and_rewrite(now(), "gmail.send", obj(json!({"subject": "hi"})))
            .await
            .expect("rewrite should succeed");
        assert!(warnings.contains(&"draft_only:recipients_missing".to_string()));

        // Display-name form resolves to the bare address.
        let (_, warnings) = policy
            .validate_and_rewrite(
                now(),
                "gmail.send",
                obj(json!({"to": "Allowed <ALLOWED@example.com>"})),
            )
            .await
            .expect("rewrite should succeed");
        assert!(warnings.is_empty());
        assert!(!policy.draft_send_required(&obj(json!({"to": "allowed@example.com"}))));
    }

    #[tokio::test]
    async fn gmail_drafts_create_always_rejects_thread_id() {
        let policy = gmail_policy(&["gmail.drafts.create"], GmailPolicy::default());
        let err = policy
            .validate_and_rewrite(
                now(),
                "gmail.drafts.create",
                obj(json!({"to": "a@b.com", "thread_id": "t1"})),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("draft creation"));
    }

    #[tokio::test]
    async fn gmail_labels_get_checks_read_allowlist() {
        let policy = gmail_policy(
            &["gmail.labels.get"],
            GmailPolicy {
                allowed_read_labels: vec!["Label_123".to_string()],
                ..GmailPolicy::default()
            },
        );
        policy.set_label_map(HashMap::from([(
            "Label_123".to_string(),
            "My Label".to_string(),
        )]));

        // The mapped display name is accepted and coerced to `label`.
        let (out, _) = policy
            .validate_and_rewrite(
                now(),
                "gmail.labels.get",
                obj(json!({"label_id": "My Label"})),
            )
            .await
            .expect("rewrite should succeed");
        assert_eq!(out.get("label").and_then(Value::as_str), Some("My Label"));
        assert!(!out.contains_key("label_id"));

        let err = policy
            .validate_and_rewrite(now(), "gmail.labels.get", obj(json!({"label": "Other"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("label not allowed"));

        // An empty read allowlist permits any label.
        let open = gmail_policy(&["gmail.labels.get"], GmailPolicy::default());
        open.validate_and_rewrite(now(), "gmail.labels.get", obj(json!({"label": "Anything"})))
            .await
            .expect("open policy should permit");
    }

    #[tokio::test]
    async fn gmail_thread_modify_validates_and_joins() {
        let policy = gmail_policy(
            &["gmail.thread.modify"],
            GmailPolicy {
                allowed_add_labels: vec!["Keep".to_string()],
                allowed_remove_labels: vec!["INBOX".to_string()],
                ..GmailPolicy::default()
            },
        );
        let (out, _) = policy
            .validate_and_rewrite(
                now(),
                "gmail.thread.modify",
                obj(json!({"id": " t1 ", "add": ["Keep"], "remove": "INBOX"})),
            )
            .await
            .expect("rewrite should succeed");
        assert_eq!(out.get("thread_id").and_then(Value::as_str), Some("t1"));
        assert_eq!(out.get("add").and_then(Value::as_str), Some("Keep"));
        assert_eq!(out.get("remove").and_then(Value::as_str), Some("INBOX"));
        assert!(!out.contains_key("id"));

        let err = policy
            .validate_and_rewrite(
                now(),
                "gmail.thread.modify",
                obj(json!({"thread_id": "t1", "add": "Other"})),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("label not allowed"));

        let err = policy
            .validate_and_rewrite(now(), "gmail.thread.modify", obj(json!({"thread_id": "t1"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("params.add or params.remove"));
    }

    #[tokio::test]
    async fn gmail_thread_modify_rejects_when_no_labels_allowed() {
        let policy = gmail_policy(&["gmail.thread.modify"], GmailPolicy::default());
        let err = policy
            .validate_and_rewrite(
                now(),
                "gmail.thread.modify",
                obj(json!({"thread_id": "t1", "add": "Anything"})),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no labels allowed for add"));
    }

    #[tokio::test]
    async fn gmail_labels_modify_accepts_single_thread_id() {
        let policy = gmail_policy(
            &["gmail.labels.modify"],
            GmailPolicy {
                allowed_add_labels: vec!["Label_123".to_string()],
                ..GmailPolicy::default()
            },
        );
        let (out, _) = policy
            .validate_and_rewrite(
                now(),
                "gmail.labels.modify",
                obj(json!({"thread_id": "t1", "add": "Label_123"})),
            )
            .await
            .expect("rewrite should succeed");
        assert_eq!(out.get("thread_ids"), Some(&json!(["t1"])));
        assert!(!out.contains_key("thread_id"));

        let err = policy
            .validate_and_rewrite(now(), "gmail.labels.modify", obj(json!({"add": "Label_123"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("params.thread_ids is required"));
    }

    #[tokio::test]
    async fn calendar_events_absolute_range_skips_provider() {
        let policy = calendar_policy(CalendarPolicy {
            allowed_calendars: vec!["cal1".to_string()],
            max_days: 30,
            ..CalendarPolicy::default()
        });
        // No provider configured: absolute bounds must still work.
        let (out, _) = policy
            .validate_and_rewrite(
                now(),
                "calendar.events",
                obj(json!({
                    "calendar_id": "cal1",
                    "from": "2024-05-15T00:00:00Z",
                    "to": "2024-05-20T00:00:00Z"
                })),
            )
            .await
            .expect("rewrite should succeed");
        assert_eq!(
            out.get("time_min").and_then(Value::as_str),
            Some("2024-05-15T00:00:00Z")
        );
        assert_eq!(
            out.get("time_max").and_then(Value::as_str),
            Some("2024-05-20T00:00:00Z")
        );
        assert!(!out.contains_key("from"));
        assert!(!out.contains_key("to"));
    }

    #[tokio::test]
    async fn calendar_events_rejects_disallowed_and_oversized() {
        let policy = calendar_policy(CalendarPolicy {
            allowed_calendars: vec!["cal1".to_string()],
            max_days: 3,
            ..CalendarPolicy::default()
        });
        let err = policy
            .validate_and_rewrite(
                now(),
                "calendar.events",
                obj(json!({"calendar_id": "other"})),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("calendar_id is not allowed"));

        let err = policy
            .validate_and_rewrite(
                now(),
                "calendar.events",
                obj(json!({
                    "calendar_id": "cal1",
                    "from": "2024-05-01T00:00:00Z",
                    "to": "2024-05-20T00:00:00Z"
                })),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds max_days"));

        let err = policy
            .validate_and_rewrite(
                now(),
                "calendar.events",
                obj(json!({
                    "calendar_id": "cal1",
                    "from": "2024-05-10T00:00:00Z",
                    "to": "2024-05-09T00:00:00Z"
                })),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("must be after time_min"));
    }

    #[tokio::test]
    async fn calendar_events_relative_flags_use_provider() {
        let policy = calendar_policy(CalendarPolicy {
            max_days: 30,
            ..CalendarPolicy::default()
        });
        let err = policy
            .validate_and_rewrite(
                now(),
                "calendar.events",
                obj(json!({"calendar_id": "cal1", "today": true})),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timezone provider not configured"));

        policy.set_time_zone_provider(Arc::new(FixedZone(chrono_tz::UTC)));
        let (out, _) = policy
            .validate_and_rewrite(
                now(),
                "calendar.events",
                obj(json!({"calendar_id": "cal1", "today": true, "week_start": "mon"})),
            )
            .await
            .expect("rewrite should succeed");
        assert_eq!(
            out.get("time_min").and_then(Value::as_str),
            Some("2024-05-15T00:00:00Z")
        );
        assert!(!out.contains_key("today"));
        assert!(!out.contains_key("week_start"));
    }

    #[tokio::test]
    async fn calendar_freebusy_requires_flags_and_checks_ids() {
        let policy = calendar_policy(CalendarPolicy {
            allowed_calendars: vec!["cal1".to_string(), "cal2".to_string()],
            max_days: 30,
            ..CalendarPolicy::default()
        });
        let err = policy
            .validate_and_rewrite(
                now(),
                "calendar.freebusy",
                obj(json!({"calendar_ids": "cal1"})),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("time_min and params.time_max"));

        let (out, _) = policy
            .validate_and_rewrite(
                now(),
                "calendar.freebusy",
                obj(json!({
                    "calendar_ids": "cal1,cal2",
                    "time_min": "2024-05-15T00:00:00Z",
                    "time_max": "2024-05-16T00:00:00Z"
                })),
            )
            .await
            .expect("rewrite should succeed");
        assert_eq!(out.get("calendar_ids").and_then(Value::as_str), Some("cal1,cal2"));

        let err = policy
            .validate_and_rewrite(
                now(),
                "calendar.freebusy",
                obj(json!({
                    "calendar_ids": ["cal1", "other"],
                    "time_min": "2024-05-15T00:00:00Z",
                    "time_max": "2024-05-16T00:00:00Z"
                })),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disallowed calendar"));
    }

    #[tokio::test]
    async fn policy_actions_requires_empty_params() {
        let mut policy = Policy::new(vec!["policy.actions".to_string()], None, None);
        policy.validate().expect("policy should validate");
        policy
            .validate_and_rewrite(now(), "policy.actions", Map::new())
            .await
            .expect("empty params should pass");
        let err = policy
            .validate_and_rewrite(now(), "policy.actions", obj(json!({"x": 1})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("params must be empty"));
    }

    #[tokio::test]
    async fn unsupported_actions_are_rejected() {
        let mut policy = Policy::new(vec!["gmail.nope".to_string()], Some(GmailPolicy::default()), None);
        policy.validate().expect("policy should validate");
        let err = policy
            .validate_and_rewrite(now(), "gmail.nope", Map::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported action"));
    }
}
