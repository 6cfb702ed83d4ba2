use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::{Policy, PolicyError};

/// Why an account could not be resolved against the set. The broker maps
/// `AccountRequired` to a validation failure and `AccountNotAllowed` to an
/// authorization failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    AccountRequired,
    AccountNotAllowed,
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::AccountRequired => write!(f, "account is required"),
            ResolveError::AccountNotAllowed => write!(f, "account not allowed"),
        }
    }
}

impl std::error::Error for ResolveError {}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicySetDoc {
    #[serde(default)]
    default_account: String,
    #[serde(default)]
    accounts: HashMap<String, Policy>,
}

/// Immutable collection of per-account policies keyed by normalized
/// (lowercased, trimmed) email address.
#[derive(Debug)]
pub struct PolicySet {
    default_account: String,
    accounts: HashMap<String, Arc<Policy>>,
}

impl PolicySet {
    /// Loads and validates the policy document. Any failure here refuses
    /// startup.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|err| {
            PolicyError::new(format!("read policy file {}: {err}", path.display()))
        })?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self, PolicyError> {
        let doc: PolicySetDoc = serde_json::from_str(data)
            .map_err(|err| PolicyError::new(format!("invalid policy json: {err}")))?;
        Self::from_doc(doc)
    }

    /// Builds a set from already-parsed policies; used directly by tests.
    pub fn new(
        default_account: impl Into<String>,
        accounts: HashMap<String, Policy>,
    ) -> Result<Self, PolicyError> {
        Self::from_doc(PolicySetDoc {
            default_account: default_account.into(),
            accounts,
        })
    }

    fn from_doc(doc: PolicySetDoc) -> Result<Self, PolicyError> {
        if doc.accounts.is_empty() {
            return Err(PolicyError::new("accounts must not be empty"));
        }

        let mut accounts = HashMap::with_capacity(doc.accounts.len());
        for (key, mut policy) in doc.accounts {
            let account = normalize_account(&key);
            if account.is_empty() {
                return Err(PolicyError::new("accounts contains empty key"));
            }
            policy
                .validate()
                .map_err(|err| PolicyError::new(format!("account {account}: {err}")))?;
            if accounts.insert(account.clone(), Arc::new(policy)).is_some() {
                return Err(PolicyError::new(format!("duplicate account {account}")));
            }
        }

        let mut default_account = doc.default_account;
        if !default_account.is_empty() {
            default_account = normalize_account(&default_account);
            if default_account.is_empty() {
                return Err(PolicyError::new("default_account is empty"));
            }
            if !accounts.contains_key(&default_account) {
                return Err(PolicyError::new(format!(
                    "default_account {default_account} not found"
                )));
            }
        }

        Ok(Self {
            default_account,
            accounts,
        })
    }

    /// Resolves a request's account. An empty account falls back to the
    /// set's default, then the broker-level `fallback`, then the sole
    /// account when exactly one exists.
    pub fn resolve(
        &self,
        account: &str,
        fallback: &str,
    ) -> Result<(Arc<Policy>, String), ResolveError> {
        let mut normalized = normalize_account(account);

        if normalized.is_empty() {
            if !self.default_account.is_empty() {
                normalized = self.default_account.clone();
            } else {
                let fb = normalize_account(fallback);
                if !fb.is_empty() {
                    normalized = fb;
                } else if self.accounts.len() == 1 {
                    if let Some(key) = self.accounts.keys().next() {
                        normalized = key.clone();
                    }
                }
            }
        }

        if normalized.is_empty() {
            return Err(ResolveError::AccountRequired);
        }

        match self.accounts.get(&normalized) {
            Some(policy) => Ok((Arc::clone(policy), normalized)),
            None => Err(ResolveError::AccountNotAllowed),
        }
    }

    pub fn accounts(&self) -> impl Iterator<Item = (&str, &Arc<Policy>)> {
        self.accounts
            .iter()
            .map(|(account, policy)| (account.as_str(), policy))
    }

    pub fn default_account(&self) -> &str {
        &self.default_account
    }
}

fn normalize_account(account: &str) -> String {
    account.trim().to_lowercase()
}
