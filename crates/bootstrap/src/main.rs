//! Policy generator: turns label/calendar/sender/send flags into a ready
//! policy document (and a matching broker config file) so a deployment
//! starts from a locked-down baseline instead of a hand-written JSON.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use serde::Serialize;

use warden_broker::config::{default_config_path, default_policy_path, ensure_config_dir};

#[derive(Parser, Debug)]
#[command(
    name = "warden-bootstrap",
    about = "Generate a starter policy and broker config for gog-warden"
)]
struct Cli {
    /// Allowed Gmail read label id/name (repeat or comma-separated). Default: INBOX.
    #[arg(long = "read-label", visible_alias = "label", value_delimiter = ',')]
    read_labels: Vec<String>,
    /// Allowed Gmail label id/name to add (repeat or comma-separated).
    #[arg(long = "add-label", value_delimiter = ',')]
    add_labels: Vec<String>,
    /// Allowed Gmail label id/name to remove (repeat or comma-separated).
    #[arg(long = "remove-label", value_delimiter = ',')]
    remove_labels: Vec<String>,
    /// Allowed calendar id (repeat or comma-separated). Default: primary.
    #[arg(long = "calendar", value_delimiter = ',')]
    calendars: Vec<String>,
    /// Allowed sender domain (repeat or comma-separated).
    #[arg(long = "sender", value_delimiter = ',')]
    senders: Vec<String>,
    /// Allowed email address for direct send (repeat or comma-separated).
    #[arg(long = "allow-send-recipient", value_delimiter = ',')]
    send_recipients: Vec<String>,
    /// Include gmail.thread.get in allowed actions.
    #[arg(long = "include-thread-get")]
    include_thread_get: bool,
    /// Include gmail.send in allowed actions.
    #[arg(long = "allow-send")]
    allow_send: bool,
    /// When true, gmail.send always creates drafts instead of sending.
    #[arg(long = "draft-only", default_value_t = true, action = ArgAction::Set)]
    draft_only: bool,
    /// Allow gmail.send/gmail.drafts.create to attach files.
    #[arg(long = "allow-attachments")]
    allow_attachments: bool,
    /// Max Gmail query window in days.
    #[arg(long = "max-gmail-days", default_value_t = 7)]
    max_gmail_days: i64,
    /// Max calendar query window in days.
    #[arg(long = "max-calendar-days", default_value_t = 7)]
    max_calendar_days: i64,
    /// Account email keying the generated policy.
    #[arg(long)]
    account: String,
    /// Write the policy to this path (default: the user config dir).
    #[arg(long, conflicts_with = "stdout")]
    out: Option<PathBuf>,
    /// Write the policy to stdout instead of a file.
    #[arg(long)]
    stdout: bool,
    /// Write the broker config file too.
    #[arg(long = "write-config", default_value_t = true, action = ArgAction::Set)]
    write_config: bool,
    /// Write the broker config file to this path.
    #[arg(long = "config-out")]
    config_out: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct PolicySetDoc {
    #[serde(skip_serializing_if = "String::is_empty")]
    default_account: String,
    accounts: BTreeMap<String, PolicyDoc>,
}

#[derive(Debug, Serialize)]
struct PolicyDoc {
    allowed_actions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gmail: Option<GmailDoc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    calendar: Option<CalendarDoc>,
}

#[derive(Debug, Serialize)]
struct GmailDoc {
    allowed_read_labels: Vec<String>,
    allowed_add_labels: Vec<String>,
    allowed_remove_labels: Vec<String>,
    allowed_senders: Vec<String>,
    allowed_send_recipients: Vec<String>,
    max_days: i64,
    allow_body: bool,
    allow_links: bool,
    draft_only: bool,
    allow_attachments: bool,
}

#[derive(Debug, Serialize)]
struct CalendarDoc {
    allowed_calendars: Vec<String>,
    allow_details: bool,
    max_days: i64,
}

fn main() {
    let cli = Cli::parse();

    let account = cli.account.trim().to_string();
    if account.is_empty() {
        fatal("--account is required for policy output");
    }

    let document = policy_document(&cli, &account);
    let mut payload = match serde_json::to_vec_pretty(&document) {
        Ok(payload) => payload,
        Err(err) => fatal(&format!("failed to encode policy: {err}")),
    };
    payload.push(b'\n');

    let mut out_path = cli.out.clone();
    if cli.stdout {
        if std::io::stdout().write_all(&payload).is_err() {
            fatal("failed to write policy to stdout");
        }
    } else {
        let path = match out_path {
            Some(path) => path,
            None => match default_policy_path() {
                Ok(path) => path,
                Err(err) => fatal(&format!("failed to resolve default policy path: {err}")),
            },
        };
        if let Err(err) = ensure_config_dir(&path) {
            fatal(&format!("failed to create policy dir: {err}"));
        }
        if let Err(err) = write_private_file(&path, &payload) {
            fatal(&format!("failed to write policy: {err}"));
        }
        out_path = Some(path);
    }

    if !cli.write_config || (cli.stdout && cli.config_out.is_none()) {
        return;
    }

    let policy_path_used = match out_path {
        Some(path) => Some(path),
        None => default_policy_path().ok(),
    };

    let config_path = match cli.config_out {
        Some(path) => path,
        None => match default_config_path() {
            Ok(path) => path,
            Err(err) => fatal(&format!("failed to resolve default config path: {err}")),
        },
    };

    let contents = config_contents(policy_path_used.as_deref(), &account);
    if let Err(err) = ensure_config_dir(&config_path) {
        fatal(&format!("failed to create config dir: {err}"));
    }
    if let Err(err) = write_private_file(&config_path, contents.as_bytes()) {
        fatal(&format!("failed to write config file: {err}"));
    }
}

fn policy_document(cli: &Cli, account: &str) -> PolicySetDoc {
    let mut read_labels = clean_list(&cli.read_labels);
    if read_labels.is_empty() {
        read_labels.push("INBOX".to_string());
    }
    let mut calendars = clean_list(&cli.calendars);
    if calendars.is_empty() {
        calendars.push("primary".to_string());
    }

    let mut actions = vec![
        "policy.actions".to_string(),
        "gmail.search".to_string(),
        "gmail.thread.list".to_string(),
        "gmail.get".to_string(),
        "calendar.list".to_string(),
        "calendar.events".to_string(),
        "calendar.freebusy".to_string(),
    ];
    if cli.include_thread_get {
        actions.push("gmail.thread.get".to_string());
    }
    if cli.allow_send {
        actions.push("gmail.send".to_string());
    }
    actions.sort();

    let policy = PolicyDoc {
        allowed_actions: actions,
        gmail: Some(GmailDoc {
            allowed_read_labels: read_labels,
            allowed_add_labels: clean_list(&cli.add_labels),
            allowed_remove_labels: clean_list(&cli.remove_labels),
            allowed_senders: clean_list(&cli.senders),
            allowed_send_recipients: clean_list(&cli.send_recipients),
            max_days: cli.max_gmail_days,
            allow_body: false,
            allow_links: false,
            draft_only: cli.draft_only,
            allow_attachments: cli.allow_attachments,
        }),
        calendar: Some(CalendarDoc {
            allowed_calendars: calendars,
            allow_details: false,
            max_days: cli.max_calendar_days,
        }),
    };

    PolicySetDoc {
        default_account: account.to_string(),
        accounts: BTreeMap::from([(account.to_string(), policy)]),
    }
}

fn clean_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn config_contents(policy_path: Option<&Path>, account: &str) -> String {
    let mut lines = vec![
        "# Generated by warden-bootstrap.".to_string(),
        "WARDEN_SOCKET_PATH=/run/gog-warden.sock".to_string(),
    ];
    if let Some(path) = policy_path {
        lines.push(format!("WARDEN_POLICY_PATH={}", path.display()));
    }
    lines.push("WARDEN_GOG_PATH=gog".to_string());
    lines.push(format!("WARDEN_GOG_ACCOUNT={account}"));
    lines.push("WARDEN_GOG_TIMEOUT_MS=30000".to_string());
    lines.push("WARDEN_LOG_FORMAT=json".to_string());
    lines.push("WARDEN_VERBOSE=false".to_string());
    let mut contents = lines.join("\n");
    contents.push('\n');
    contents
}

fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}
