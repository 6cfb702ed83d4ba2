//! Agent-facing CLI: maps dotted subcommands onto broker requests and
//! speaks the wire protocol over the broker's Unix socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use ulid::Ulid;

use warden_contracts::{Request, Response};

#[derive(Parser, Debug)]
#[command(name = "warden-client", about = "Client for the gog-warden broker")]
struct Cli {
    /// Broker socket path.
    #[arg(long, env = "WARDEN_SOCKET", default_value = "/run/gog-warden.sock")]
    socket: PathBuf,
    /// Account email selecting the policy (optional).
    #[arg(long, env = "WARDEN_ACCOUNT", default_value = "")]
    account: String,
    /// Request timeout in milliseconds.
    #[arg(long, default_value_t = 15_000)]
    timeout_ms: u64,
    /// Pretty-print the JSON response.
    #[arg(long)]
    pretty: bool,
    /// Request id (random when omitted).
    #[arg(long, default_value = "")]
    id: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(name = "gmail.search", about = "Search threads")]
    GmailSearch {
        /// Gmail search query.
        #[arg(long)]
        query: String,
        #[arg(long)]
        max: Option<u64>,
        #[arg(long)]
        page: Option<String>,
        /// Show the oldest message date.
        #[arg(long)]
        oldest: bool,
    },
    #[command(name = "gmail.thread.get", about = "Get a thread (metadata)")]
    GmailThreadGet {
        #[arg(long)]
        id: String,
    },
    #[command(name = "gmail.thread.modify", about = "Modify labels on a thread")]
    GmailThreadModify {
        #[arg(long)]
        id: String,
        /// Labels to add (comma-separated).
        #[arg(long)]
        add: Option<String>,
        /// Labels to remove (comma-separated).
        #[arg(long)]
        remove: Option<String>,
    },
    #[command(name = "gmail.get", about = "Get a message (metadata)")]
    GmailGet {
        #[arg(long)]
        id: String,
    },
    #[command(name = "gmail.send", about = "Send or draft an email (policy controlled)")]
    GmailSend {
        /// Recipients (comma-separated).
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        cc: Option<String>,
        #[arg(long)]
        bcc: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        body: Option<String>,
        #[arg(long = "body-html")]
        body_html: Option<String>,
        #[arg(long = "reply-to-message-id")]
        reply_to_message_id: Option<String>,
        /// Reply within a thread.
        #[arg(long = "thread-id")]
        thread_id: Option<String>,
        #[arg(long = "reply-all")]
        reply_all: bool,
        #[arg(long = "reply-to")]
        reply_to: Option<String>,
        /// Send-as address.
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        track: bool,
        #[arg(long = "track-split")]
        track_split: bool,
        /// Attachment file path (repeatable).
        #[arg(long)]
        attach: Vec<String>,
    },
    #[command(name = "gmail.labels.list", about = "List labels")]
    GmailLabelsList,
    #[command(name = "gmail.labels.get", about = "Get label details")]
    GmailLabelsGet {
        /// Label id or name.
        #[arg(long)]
        label: String,
    },
    #[command(name = "gmail.labels.modify", about = "Modify labels on multiple threads")]
    GmailLabelsModify {
        /// Thread id (repeatable).
        #[arg(long = "thread-id", required = true)]
        thread_ids: Vec<String>,
        #[arg(long)]
        add: Option<String>,
        #[arg(long)]
        remove: Option<String>,
    },
    #[command(name = "calendar.list", about = "List calendars")]
    CalendarList {
        #[arg(long)]
        max: Option<u64>,
        #[arg(long)]
        page: Option<String>,
    },
    #[command(name = "calendar.events", about = "List events from a calendar")]
    CalendarEvents {
        #[arg(long = "calendar-id")]
        calendar_id: String,
        /// Start time (RFC3339 or relative expression).
        #[arg(long)]
        from: Option<String>,
        /// End time (RFC3339 or relative expression).
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        today: bool,
        #[arg(long)]
        tomorrow: bool,
        #[arg(long)]
        week: bool,
        /// Next N days.
        #[arg(long)]
        days: Option<i64>,
        /// Week start day (sun, mon, ...).
        #[arg(long = "week-start")]
        week_start: Option<String>,
        #[arg(long)]
        max: Option<u64>,
        #[arg(long)]
        page: Option<String>,
        #[arg(long)]
        query: Option<String>,
    },
    #[command(name = "calendar.freebusy", about = "Get free/busy blocks")]
    CalendarFreebusy {
        /// Calendar id (repeatable).
        #[arg(long = "calendar-id", required = true)]
        calendar_ids: Vec<String>,
        #[arg(long, required = true)]
        from: String,
        #[arg(long, required = true)]
        to: String,
    },
    #[command(name = "policy.actions", about = "List allowed actions")]
    PolicyActions,
}

#[derive(Debug)]
struct ClientError {
    message: String,
}

impl ClientError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ClientError {}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (action, params) = match to_action_params(cli.command) {
        Ok(parsed) => parsed,
        Err(err) => fatal(&err),
    };

    let id = if cli.id.is_empty() {
        Ulid::new().to_string()
    } else {
        cli.id
    };

    let request = Request {
        id,
        action,
        account: cli.account,
        params: Some(params),
    };

    let (resp, raw) = match do_request(
        &cli.socket,
        Duration::from_millis(cli.timeout_ms),
        &request,
    )
    .await
    {
        Ok(result) => result,
        Err(err) => fatal(&err),
    };

    write_response(cli.pretty, &resp, &raw);
    if !resp.ok {
        std::process::exit(1);
    }
}

fn to_action_params(command: Command) -> Result<(String, Map<String, Value>), ClientError> {
    let mut params = Map::new();
    let action = match command {
        Command::GmailSearch {
            query,
            max,
            page,
            oldest,
        } => {
            if query.trim().is_empty() {
                return Err(ClientError::new("--query is required"));
            }
            params.insert("query".to_string(), Value::String(query));
            insert_u64(&mut params, "max", max);
            insert_string(&mut params, "page", page);
            if oldest {
                params.insert("oldest".to_string(), Value::Bool(true));
            }
            "gmail.search"
        }
        Command::GmailThreadGet { id } => {
            params.insert("thread_id".to_string(), Value::String(id));
            "gmail.thread.get"
        }
        Command::GmailThreadModify { id, add, remove } => {
            if blank(&add) && blank(&remove) {
                return Err(ClientError::new("--add or --remove is required"));
            }
            params.insert("thread_id".to_string(), Value::String(id));
            insert_string(&mut params, "add", add);
            insert_string(&mut params, "remove", remove);
            "gmail.thread.modify"
        }
        Command::GmailGet { id } => {
            params.insert("message_id".to_string(), Value::String(id));
            "gmail.get"
        }
        Command::GmailSend {
            to,
            cc,
            bcc,
            subject,
            body,
            body_html,
            reply_to_message_id,
            thread_id,
            reply_all,
            reply_to,
            from,
            track,
            track_split,
            attach,
        } => {
            insert_string(&mut params, "to", to);
            insert_string(&mut params, "cc", cc);
            insert_string(&mut params, "bcc", bcc);
            insert_string(&mut params, "subject", subject);
            insert_string(&mut params, "body", body);
            insert_string(&mut params, "body_html", body_html);
            insert_string(&mut params, "reply_to_message_id", reply_to_message_id);
            insert_string(&mut params, "thread_id", thread_id);
            if reply_all {
                params.insert("reply_all".to_string(), Value::Bool(true));
            }
            insert_string(&mut params, "reply_to", reply_to);
            insert_string(&mut params, "from", from);
            if track {
                params.insert("track".to_string(), Value::Bool(true));
            }
            if track_split {
                params.insert("track_split".to_string(), Value::Bool(true));
            }
            if !attach.is_empty() {
                params.insert(
                    "attach".to_string(),
                    Value::Array(attach.into_iter().map(Value::String).collect()),
                );
            }
            "gmail.send"
        }
        Command::GmailLabelsList => "gmail.labels.list",
        Command::GmailLabelsGet { label } => {
            params.insert("label".to_string(), Value::String(label));
            "gmail.labels.get"
        }
        Command::GmailLabelsModify {
            thread_ids,
            add,
            remove,
        } => {
            if blank(&add) && blank(&remove) {
                return Err(ClientError::new("--add or --remove is required"));
            }
            params.insert(
                "thread_ids".to_string(),
                Value::Array(thread_ids.into_iter().map(Value::String).collect()),
            );
            insert_string(&mut params, "add", add);
            insert_string(&mut params, "remove", remove);
            "gmail.labels.modify"
        }
        Command::CalendarList { max, page } => {
            insert_u64(&mut params, "max", max);
            insert_string(&mut params, "page", page);
            "calendar.list"
        }
        Command::CalendarEvents {
            calendar_id,
            from,
            to,
            today,
            tomorrow,
            week,
            days,
            week_start,
            max,
            page,
            query,
        } => {
            params.insert("calendar_id".to_string(), Value::String(calendar_id));
            insert_string(&mut params, "from", from);
            insert_string(&mut params, "to", to);
            if today {
                params.insert("today".to_string(), Value::Bool(true));
            }
            if tomorrow {
                params.insert("tomorrow".to_string(), Value::Bool(true));
            }
            if week {
                params.insert("week".to_string(), Value::Bool(true));
            }
            if let Some(days) = days.filter(|d| *d > 0) {
                params.insert("days".to_string(), Value::from(days));
            }
            insert_string(&mut params, "week_start", week_start);
            insert_u64(&mut params, "max", max);
            insert_string(&mut params, "page", page);
            insert_string(&mut params, "query", query);
            "calendar.events"
        }
        Command::CalendarFreebusy {
            calendar_ids,
            from,
            to,
        } => {
            params.insert(
                "calendar_ids".to_string(),
                Value::Array(calendar_ids.into_iter().map(Value::String).collect()),
            );
            params.insert("time_min".to_string(), Value::String(from));
            params.insert("time_max".to_string(), Value::String(to));
            "calendar.freebusy"
        }
        Command::PolicyActions => "policy.actions",
    };
    Ok((action.to_string(), params))
}

fn blank(value: &Option<String>) -> bool {
    value
        .as_deref()
        .map(|v| v.trim().is_empty())
        .unwrap_or(true)
}

fn insert_string(params: &mut Map<String, Value>, key: &str, value: Option<String>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        params.insert(key.to_string(), Value::String(value));
    }
}

fn insert_u64(params: &mut Map<String, Value>, key: &str, value: Option<u64>) {
    if let Some(value) = value.filter(|v| *v > 0) {
        params.insert(key.to_string(), Value::from(value));
    }
}

/// POSTs the request over the Unix socket with a minimal HTTP/1.1 exchange
/// and parses the JSON response body.
async fn do_request(
    socket: &Path,
    timeout: Duration,
    request: &Request,
) -> Result<(Response, Vec<u8>), ClientError> {
    let body = serde_json::to_vec(request)
        .map_err(|err| ClientError::new(format!("encode request: {err}")))?;

    let exchange = async {
        let mut stream = UnixStream::connect(socket).await.map_err(|err| {
            ClientError::new(format!("connect {}: {err}", socket.display()))
        })?;

        let head = format!(
            "POST /v1/request HTTP/1.1\r\nHost: warden\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream
            .write_all(head.as_bytes())
            .await
            .map_err(|err| ClientError::new(format!("write request: {err}")))?;
        stream
            .write_all(&body)
            .await
            .map_err(|err| ClientError::new(format!("write request: {err}")))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(|err| ClientError::new(format!("read response: {err}")))?;
        Ok::<Vec<u8>, ClientError>(raw)
    };

    let raw = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ClientError::new("request timed out"))??;

    let body = http_body(&raw)?;
    let parsed: Response = serde_json::from_slice(body)
        .map_err(|err| ClientError::new(format!("invalid response json: {err}")))?;
    Ok((parsed, body.to_vec()))
}

fn http_body(raw: &[u8]) -> Result<&[u8], ClientError> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| ClientError::new("invalid http response"))?;
    Ok(&raw[split + 4..])
}

fn write_response(pretty: bool, resp: &Response, raw: &[u8]) {
    if pretty {
        match serde_json::to_string_pretty(resp) {
            Ok(text) => println!("{text}"),
            Err(_) => println!("{}", String::from_utf8_lossy(raw)),
        }
    } else {
        println!("{}", String::from_utf8_lossy(raw));
    }

    if let Some(err) = resp.error.as_ref().filter(|_| !resp.ok) {
        eprintln!("error: {}: {}", err.code.as_str(), err.message);
        if !err.details.is_empty() {
            eprintln!("details: {}", err.details);
        }
    }
    if !resp.warnings.is_empty() {
        eprintln!("warnings: {}", resp.warnings.join(", "));
    }
}

fn fatal(err: &ClientError) -> ! {
    eprintln!("{err}");
    std::process::exit(2);
}
