//! Per-account policy model: the declarative document loaded from disk, its
//! validation invariants, the per-action parameter rewrite table, and the
//! lazily-populated Gmail label id↔name map consulted by both rewrite and
//! redaction.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard};

use async_trait::async_trait;
use chrono_tz::Tz;
use serde::Deserialize;

mod params;
mod rewrite;
mod set;

pub use params::{get_bool, get_i64, get_string, get_string_any, get_string_list};
pub use set::{PolicySet, ResolveError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyError {
    message: String,
}

impl PolicyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PolicyError {}

/// Supplies the zone used to anchor relative calendar time flags. The broker
/// wires this to an upstream `calendar.list` lookup per account.
#[async_trait]
pub trait TimeZoneProvider: Send + Sync {
    async fn time_zone(&self) -> Result<Tz, PolicyError>;
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    #[serde(default)]
    pub allowed_actions: Vec<String>,
    #[serde(default)]
    pub gmail: Option<GmailPolicy>,
    #[serde(default)]
    pub calendar: Option<CalendarPolicy>,

    #[serde(skip)]
    allowed: HashSet<String>,
    #[serde(skip)]
    labels: RwLock<LabelMap>,
    #[serde(skip)]
    time_zone: OnceLock<Arc<dyn TimeZoneProvider>>,
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("allowed_actions", &self.allowed_actions)
            .field("gmail", &self.gmail)
            .field("calendar", &self.calendar)
            .field("allowed", &self.allowed)
            .field("labels", &self.labels)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GmailPolicy {
    pub allowed_read_labels: Vec<String>,
    pub allowed_add_labels: Vec<String>,
    pub allowed_remove_labels: Vec<String>,
    pub allowed_senders: Vec<String>,
    pub allowed_send_recipients: Vec<String>,
    pub max_days: i64,
    pub allow_body: bool,
    pub allow_links: bool,
    pub draft_only: bool,
    pub allow_attachments: bool,
}

impl GmailPolicy {
    /// True when any of the three label allowlists is populated, meaning the
    /// label id↔name map is needed before searches run.
    pub fn has_label_allowlist(&self) -> bool {
        !self.allowed_read_labels.is_empty()
            || !self.allowed_add_labels.is_empty()
            || !self.allowed_remove_labels.is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CalendarPolicy {
    pub allowed_calendars: Vec<String>,
    pub allow_details: bool,
    pub max_days: i64,
}

#[derive(Debug, Default)]
struct LabelMap {
    id_to_name: HashMap<String, String>,
    name_to_id: HashMap<String, String>,
}

impl Policy {
    pub fn new(
        allowed_actions: Vec<String>,
        gmail: Option<GmailPolicy>,
        calendar: Option<CalendarPolicy>,
    ) -> Self {
        Self {
            allowed_actions,
            gmail,
            calendar,
            allowed: HashSet::new(),
            labels: RwLock::new(LabelMap::default()),
            time_zone: OnceLock::new(),
        }
    }

    pub fn validate(&mut self) -> Result<(), PolicyError> {
        if self.allowed_actions.is_empty() {
            return Err(PolicyError::new("allowed_actions must not be empty"));
        }
        let mut allowed = HashSet::with_capacity(self.allowed_actions.len());
        let mut needs_gmail = false;
        let mut needs_calendar = false;
        for action in &self.allowed_actions {
            let action = action.trim();
            if action.is_empty() {
                return Err(PolicyError::new("allowed_actions contains empty action"));
            }
            if action.starts_with("gmail.") {
                needs_gmail = true;
            }
            if action.starts_with("calendar.") {
                needs_calendar = true;
            }
            allowed.insert(action.to_string());
        }
        if needs_gmail && self.gmail.is_none() {
            return Err(PolicyError::new("gmail policy is required for gmail actions"));
        }
        if needs_calendar && self.calendar.is_none() {
            return Err(PolicyError::new(
                "calendar policy is required for calendar actions",
            ));
        }
        self.allowed = allowed;
        Ok(())
    }

    pub fn is_action_allowed(&self, action: &str) -> bool {
        self.allowed.contains(action)
    }

    /// Replaces the label map with a normalized copy of `id_to_name`.
    /// Lookups are case-insensitive on both ids and display names.
    pub fn set_label_map(&self, id_to_name: HashMap<String, String>) {
        let mut normalized = HashMap::new();
        let mut reversed = HashMap::new();
        for (id, name) in id_to_name {
            let id = id.trim();
            let name = name.trim();
            if id.is_empty() || name.is_empty() {
                continue;
            }
            normalized.insert(id.to_lowercase(), name.to_string());
            reversed.insert(name.to_lowercase(), id.to_string());
        }
        let mut labels = match self.labels.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        labels.id_to_name = normalized;
        labels.name_to_id = reversed;
    }

    pub fn label_name_for_id(&self, id: &str) -> Option<String> {
        self.read_labels()
            .id_to_name
            .get(&id.trim().to_lowercase())
            .cloned()
    }

    pub fn label_id_for_name(&self, name: &str) -> Option<String> {
        self.read_labels()
            .name_to_id
            .get(&name.trim().to_lowercase())
            .cloned()
    }

    fn read_labels(&self) -> RwLockReadGuard<'_, LabelMap> {
        match self.labels.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Installs the zone provider. Only the first call takes effect; the
    /// provider is wired once at startup, before requests are served.
    pub fn set_time_zone_provider(&self, provider: Arc<dyn TimeZoneProvider>) {
        let _ = self.time_zone.set(provider);
    }

    pub(crate) fn time_zone_provider(&self) -> Option<&Arc<dyn TimeZoneProvider>> {
        self.time_zone.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_actions() {
        let mut policy = Policy::new(Vec::new(), None, None);
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("must not be empty"));

        let mut policy = Policy::new(vec!["  ".to_string()], None, None);
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("empty action"));
    }

    #[test]
    fn validate_requires_section_for_prefixed_actions() {
        let mut policy = Policy::new(vec!["gmail.search".to_string()], None, None);
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("gmail policy is required"));

        let mut policy = Policy::new(vec!["calendar.events".to_string()], None, None);
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("calendar policy is required"));

        let mut policy = Policy::new(
            vec!["policy.actions".to_string()],
            None,
            None,
        );
        policy.validate().expect("non-prefixed actions need no section");
    }

    #[test]
    fn action_allowlist_trims_entries() {
        let mut policy = Policy::new(
            vec![" gmail.search ".to_string()],
            Some(GmailPolicy::default()),
            None,
        );
        policy.validate().expect("policy should validate");
        assert!(policy.is_action_allowed("gmail.search"));
        assert!(!policy.is_action_allowed("gmail.send"));
    }

    #[test]
    fn label_map_is_case_insensitive_both_ways() {
        let policy = Policy::new(
            vec!["gmail.search".to_string()],
            Some(GmailPolicy::default()),
            None,
        );
        policy.set_label_map(HashMap::from([(
            "Label_123".to_string(),
            "My Label".to_string(),
        )]));
        assert_eq!(
            policy.label_name_for_id("label_123").as_deref(),
            Some("My Label")
        );
        assert_eq!(
            policy.label_id_for_name(" my label ").as_deref(),
            Some("Label_123")
        );
        assert!(policy.label_name_for_id("other").is_none());
    }

    #[test]
    fn label_map_skips_blank_entries() {
        let policy = Policy::new(
            vec!["gmail.search".to_string()],
            Some(GmailPolicy::default()),
            None,
        );
        policy.set_label_map(HashMap::from([
            ("".to_string(), "Name".to_string()),
            ("Label_1".to_string(), " ".to_string()),
            ("Label_2".to_string(), "Kept".to_string()),
        ]));
        assert!(policy.label_name_for_id("").is_none());
        assert!(policy.label_name_for_id("label_1").is_none());
        assert_eq!(policy.label_name_for_id("label_2").as_deref(), Some("Kept"));
    }
}
