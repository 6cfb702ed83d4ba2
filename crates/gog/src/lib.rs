//! Upstream adapter: maps `action + params` onto a `gog` subprocess
//! invocation and parses its JSON output. Each supported action has a static
//! spec describing its command words, positional keys and flag mappings.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy)]
pub struct ActionSpec {
    pub command: &'static [&'static str],
    pub positional: &'static [&'static str],
    pub param_flags: &'static [(&'static str, &'static str)],
    pub multi_value_flags: &'static [(&'static str, &'static str)],
}

pub fn action_spec(action: &str) -> Option<ActionSpec> {
    const NO_FLAGS: &[(&str, &str)] = &[];
    const SEARCH_FLAGS: &[(&str, &str)] =
        &[("max", "--max"), ("page", "--page"), ("oldest", "--oldest")];
    const LABEL_FLAGS: &[(&str, &str)] = &[("add", "--add"), ("remove", "--remove")];
    const SEND_FLAGS: &[(&str, &str)] = &[
        ("to", "--to"),
        ("cc", "--cc"),
        ("bcc", "--bcc"),
        ("subject", "--subject"),
        ("body", "--body"),
        ("body_html", "--body-html"),
        ("reply_to_message_id", "--reply-to-message-id"),
        ("thread_id", "--thread-id"),
        ("reply_all", "--reply-all"),
        ("reply_to", "--reply-to"),
        ("from", "--from"),
        ("track", "--track"),
        ("track_split", "--track-split"),
    ];
    const DRAFT_FLAGS: &[(&str, &str)] = &[
        ("to", "--to"),
        ("cc", "--cc"),
        ("bcc", "--bcc"),
        ("subject", "--subject"),
        ("body", "--body"),
        ("body_html", "--body-html"),
        ("reply_to_message_id", "--reply-to-message-id"),
        ("reply_to", "--reply-to"),
        ("from", "--from"),
    ];
    const ATTACH_FLAGS: &[(&str, &str)] = &[("attach", "--attach")];

    match action {
        "gmail.search" | "gmail.thread.list" => Some(ActionSpec {
            command: &["gmail", "search"],
            positional: &["query"],
            param_flags: SEARCH_FLAGS,
            multi_value_flags: NO_FLAGS,
        }),
        "gmail.thread.get" => Some(ActionSpec {
            command: &["gmail", "thread", "get"],
            positional: &["thread_id"],
            param_flags: NO_FLAGS,
            multi_value_flags: NO_FLAGS,
        }),
        "gmail.thread.modify" => Some(ActionSpec {
            command: &["gmail", "thread", "modify"],
            positional: &["thread_id"],
            param_flags: LABEL_FLAGS,
            multi_value_flags: NO_FLAGS,
        }),
        "gmail.get" => Some(ActionSpec {
            command: &["gmail", "get"],
            positional: &["message_id"],
            param_flags: &[("format", "--format"), ("headers", "--headers")],
            multi_value_flags: NO_FLAGS,
        }),
        "gmail.send" => Some(ActionSpec {
            command: &["gmail", "send"],
            positional: &[],
            param_flags: SEND_FLAGS,
            multi_value_flags: ATTACH_FLAGS,
        }),
        "gmail.drafts.create" => Some(ActionSpec {
            command: &["gmail", "drafts", "create"],
            positional: &[],
            param_flags: DRAFT_FLAGS,
            multi_value_flags: ATTACH_FLAGS,
        }),
        "gmail.labels.list" => Some(ActionSpec {
            command: &["gmail", "labels", "list"],
            positional: &[],
            param_flags: NO_FLAGS,
            multi_value_flags: NO_FLAGS,
        }),
        "gmail.labels.get" => Some(ActionSpec {
            command: &["gmail", "labels", "get"],
            positional: &["label"],
            param_flags: NO_FLAGS,
            multi_value_flags: NO_FLAGS,
        }),
        "gmail.labels.modify" => Some(ActionSpec {
            command: &["gmail", "labels", "modify"],
            positional: &["thread_ids"],
            param_flags: LABEL_FLAGS,
            multi_value_flags: NO_FLAGS,
        }),
        "calendar.list" => Some(ActionSpec {
            command: &["calendar", "calendars"],
            positional: &[],
            param_flags: &[("max", "--max"), ("page", "--page")],
            multi_value_flags: NO_FLAGS,
        }),
        "calendar.events" => Some(ActionSpec {
            command: &["calendar", "events"],
            positional: &["calendar_id"],
            param_flags: &[
                ("time_min", "--from"),
                ("time_max", "--to"),
                ("max", "--max"),
                ("page", "--page"),
                ("query", "--query"),
            ],
            multi_value_flags: NO_FLAGS,
        }),
        "calendar.freebusy" => Some(ActionSpec {
            command: &["calendar", "freebusy"],
            positional: &["calendar_ids"],
            param_flags: &[("time_min", "--from"), ("time_max", "--to")],
            multi_value_flags: NO_FLAGS,
        }),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GogError {
    NoCommandMapping(String),
    MissingParam(String),
    InvalidParam { key: String, message: String },
    UnknownParams(Vec<String>),
    Spawn(String),
    Failed { status: String, stderr: String },
    TimedOut,
    InvalidJson(String),
}

impl std::fmt::Display for GogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GogError::NoCommandMapping(action) => {
                write!(f, "no command mapping for action: {action}")
            }
            GogError::MissingParam(key) => write!(f, "missing required param: {key}"),
            GogError::InvalidParam { key, message } => write!(f, "param {key}: {message}"),
            GogError::UnknownParams(keys) => write!(f, "unknown params: {}", keys.join(", ")),
            GogError::Spawn(message) => write!(f, "gog failed to start: {message}"),
            GogError::Failed { status, stderr } => write!(f, "gog failed: {status}: {stderr}"),
            GogError::TimedOut => write!(f, "gog timed out"),
            GogError::InvalidJson(message) => write!(f, "invalid gog json: {message}"),
        }
    }
}

impl std::error::Error for GogError {}

/// Executes one upstream action and yields its parsed JSON output.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, action: &str, params: &Map<String, Value>) -> Result<Value, GogError>;
}

/// Hands out runners bound to a specific account credential.
pub trait RunnerProvider: Send + Sync {
    fn runner_for(&self, account: &str) -> Arc<dyn Runner>;
}

#[derive(Debug, Clone)]
pub struct GogRunner {
    pub path: String,
    pub account: String,
    pub timeout: Duration,
}

#[async_trait]
impl Runner for GogRunner {
    async fn run(&self, action: &str, params: &Map<String, Value>) -> Result<Value, GogError> {
        let spec = action_spec(action)
            .ok_or_else(|| GogError::NoCommandMapping(action.to_string()))?;
        let args = build_args(&spec, params)?;

        let mut cmd = tokio::process::Command::new(&self.path);
        if !self.account.is_empty() {
            cmd.arg("--account").arg(&self.account);
        }
        cmd.arg("--json").arg("--no-input");
        cmd.args(spec.command);
        cmd.args(&args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|err| GogError::Spawn(err.to_string()))?;
        let pid = child.id();

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|err| GogError::Spawn(err.to_string()))?,
            Err(_) => {
                // The dropped future already killed the child; take the rest
                // of its process group with it.
                if let Some(pid) = pid {
                    let _ = nix::sys::signal::killpg(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::Signal::SIGKILL,
                    );
                }
                return Err(GogError::TimedOut);
            }
        };

        if !output.status.success() {
            let status = match output.status.code() {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            };
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GogError::Failed {
                status,
                stderr: truncate(&stderr, 256),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|err| GogError::InvalidJson(err.to_string()))
    }
}

/// Per-account runner factory. An empty account falls back to the broker's
/// default; runners are cheap and created per request.
#[derive(Debug, Clone)]
pub struct RunnerFactory {
    pub path: String,
    pub default_account: String,
    pub timeout: Duration,
}

impl RunnerProvider for RunnerFactory {
    fn runner_for(&self, account: &str) -> Arc<dyn Runner> {
        let mut resolved = account.trim();
        if resolved.is_empty() {
            resolved = self.default_account.trim();
        }
        Arc::new(GogRunner {
            path: self.path.clone(),
            account: resolved.to_string(),
            timeout: self.timeout,
        })
    }
}

/// Builds the argument list for `spec` from `params`. Every param must map
/// to a positional or a flag; leftovers are rejected before any subprocess
/// is spawned.
pub fn build_args(spec: &ActionSpec, params: &Map<String, Value>) -> Result<Vec<String>, GogError> {
    let mut args = Vec::new();

    for key in spec.positional {
        let val = params
            .get(*key)
            .ok_or_else(|| GogError::MissingParam(key.to_string()))?;
        let vals = normalize_value(val).map_err(|message| GogError::InvalidParam {
            key: key.to_string(),
            message,
        })?;
        if vals.is_empty() {
            return Err(GogError::InvalidParam {
                key: key.to_string(),
                message: "empty value".to_string(),
            });
        }
        // Free/busy calendars travel as one comma-joined argument.
        if *key == "calendar_ids" {
            args.push(vals.join(","));
        } else {
            args.extend(vals);
        }
    }

    for (key, flag) in spec.param_flags {
        if let Some(val) = params.get(*key) {
            if let Value::Bool(b) = val {
                if *b {
                    args.push(flag.to_string());
                }
                continue;
            }
            let vals = normalize_value(val).map_err(|message| GogError::InvalidParam {
                key: key.to_string(),
                message,
            })?;
            if let Some(first) = vals.into_iter().next() {
                args.push(flag.to_string());
                args.push(first);
            }
        }
    }

    for (key, flag) in spec.multi_value_flags {
        if let Some(val) = params.get(*key) {
            let vals = normalize_value(val).map_err(|message| GogError::InvalidParam {
                key: key.to_string(),
                message,
            })?;
            for v in vals {
                args.push(flag.to_string());
                args.push(v);
            }
        }
    }

    let mut unknown: Vec<String> = params
        .keys()
        .filter(|key| {
            !spec.positional.contains(&key.as_str())
                && !spec.param_flags.iter().any(|(k, _)| k == key)
                && !spec.multi_value_flags.iter().any(|(k, _)| k == key)
        })
        .cloned()
        .collect();
    if !unknown.is_empty() {
        unknown.sort();
        return Err(GogError::UnknownParams(unknown));
    }

    Ok(args)
}

fn normalize_value(val: &Value) -> Result<Vec<String>, String> {
    match val {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(vec![i.to_string()])
            } else if let Some(f) = n.as_f64() {
                Ok(vec![(f as i64).to_string()])
            } else {
                Err("unsupported numeric value".to_string())
            }
        }
        Value::Bool(b) => Ok(vec![if *b { "true" } else { "false" }.to_string()]),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.extend(normalize_value(item)?);
            }
            Ok(out)
        }
        Value::Null => Err("unsupported value type null".to_string()),
        Value::Object(_) => Err("unsupported value type object".to_string()),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
