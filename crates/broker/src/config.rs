use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_CONFIG_DIR: &str = "gog-warden";
const POLICY_FILE_NAME: &str = "policy.json";
const CONFIG_FILE_NAME: &str = "warden.conf";

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub socket_path: String,
    pub policy_path: String,
    pub gog_path: String,
    pub gog_account: String,
    pub gog_timeout: Duration,
    pub log_format: LogFormat,
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl BrokerConfig {
    /// Loads config from the `WARDEN_CONFIG_PATH` file (falling back to the
    /// default config path when that file exists) merged under the process
    /// environment (environment wins).
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        let explicit = std::env::var("WARDEN_CONFIG_PATH")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        match explicit {
            Some(path) => merged.extend(parse_env_file(&path)?),
            None => {
                if let Ok(default_path) = default_config_path() {
                    if default_path.exists() {
                        merged.extend(parse_env_file(default_path.to_string_lossy().as_ref())?);
                    }
                }
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let socket_path = kv
            .get("WARDEN_SOCKET_PATH")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or("/run/gog-warden.sock")
            .to_string();

        let policy_path = require_nonempty(kv, "WARDEN_POLICY_PATH")?;

        let gog_path = kv
            .get("WARDEN_GOG_PATH")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or("gog")
            .to_string();

        let gog_account = kv
            .get("WARDEN_GOG_ACCOUNT")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or("")
            .to_string();

        let gog_timeout_ms =
            parse_u64(kv.get("WARDEN_GOG_TIMEOUT_MS"), 30_000, "WARDEN_GOG_TIMEOUT_MS")?;
        if gog_timeout_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "WARDEN_GOG_TIMEOUT_MS must be >= 1".to_string(),
            });
        }

        let log_format = parse_log_format(kv.get("WARDEN_LOG_FORMAT"))?;
        let verbose = parse_bool(kv.get("WARDEN_VERBOSE")).unwrap_or(false);

        Ok(Self {
            socket_path,
            policy_path,
            gog_path,
            gog_account,
            gog_timeout: Duration::from_millis(gog_timeout_ms),
            log_format,
            verbose,
        })
    }
}

/// Per-user config directory: `$XDG_CONFIG_HOME/gog-warden`, falling back
/// to `$HOME/.config/gog-warden`.
pub fn config_dir() -> Result<PathBuf, StartupError> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let xdg = xdg.trim();
        if !xdg.is_empty() {
            return Ok(PathBuf::from(xdg).join(APP_CONFIG_DIR));
        }
    }
    match std::env::var("HOME") {
        Ok(home) if !home.trim().is_empty() => {
            Ok(PathBuf::from(home).join(".config").join(APP_CONFIG_DIR))
        }
        _ => Err(StartupError {
            code: "ERR_CONFIG_DIR",
            message: "config dir not available".to_string(),
        }),
    }
}

pub fn default_policy_path() -> Result<PathBuf, StartupError> {
    Ok(config_dir()?.join(POLICY_FILE_NAME))
}

pub fn default_config_path() -> Result<PathBuf, StartupError> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Creates the parent directory of `path` (mode 0700) when it is missing.
pub fn ensure_config_dir(path: &Path) -> Result<(), StartupError> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    if dir.as_os_str().is_empty() || dir == Path::new("/") {
        return Ok(());
    }
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|err| StartupError {
            code: "ERR_CONFIG_DIR",
            message: format!("failed to create {}: {err}", dir.display()),
        })
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    let value = kv.get(key).map(|v| v.trim()).unwrap_or("");
    if value.is_empty() {
        return Err(StartupError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        });
    }
    Ok(value.to_string())
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;
    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn parse_log_format(value: Option<&String>) -> Result<LogFormat, StartupError> {
    let format = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("json");
    match format {
        "json" => Ok(LogFormat::Json),
        "text" => Ok(LogFormat::Text),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "WARDEN_LOG_FORMAT must be json or text".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_ok_env() -> HashMap<String, String> {
        HashMap::from([(
            "WARDEN_POLICY_PATH".to_string(),
            "/etc/gog-warden/policy.json".to_string(),
        )])
    }

    #[test]
    fn defaults_apply() {
        let cfg = BrokerConfig::from_kv(&minimal_ok_env()).expect("config should load");
        assert_eq!(cfg.socket_path, "/run/gog-warden.sock");
        assert_eq!(cfg.gog_path, "gog");
        assert_eq!(cfg.gog_timeout, Duration::from_secs(30));
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert!(!cfg.verbose);
    }

    #[test]
    fn missing_policy_path_fails() {
        let err = BrokerConfig::from_kv(&HashMap::new()).unwrap_err();
        assert_eq!(err.code, "ERR_MISSING_CONFIG");
    }

    #[test]
    fn invalid_values_fail() {
        let mut env = minimal_ok_env();
        env.insert("WARDEN_GOG_TIMEOUT_MS".to_string(), "soon".to_string());
        assert_eq!(
            BrokerConfig::from_kv(&env).unwrap_err().code,
            "ERR_INVALID_CONFIG"
        );

        let mut env = minimal_ok_env();
        env.insert("WARDEN_GOG_TIMEOUT_MS".to_string(), "0".to_string());
        assert_eq!(
            BrokerConfig::from_kv(&env).unwrap_err().code,
            "ERR_INVALID_CONFIG"
        );

        let mut env = minimal_ok_env();
        env.insert("WARDEN_LOG_FORMAT".to_string(), "yaml".to_string());
        assert_eq!(
            BrokerConfig::from_kv(&env).unwrap_err().code,
            "ERR_INVALID_CONFIG"
        );
    }

    #[test]
    fn config_file_parses_and_strips_quotes() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("warden.conf");
        let mut file = std::fs::File::create(&path).expect("config file should be created");
        file.write_all(
            b"# comment\nWARDEN_POLICY_PATH=\"/tmp/policy.json\"\nWARDEN_VERBOSE=true\n",
        )
        .expect("config file should be written");

        let kv = parse_env_file(path.to_string_lossy().as_ref()).expect("file should parse");
        assert_eq!(kv.get("WARDEN_POLICY_PATH").map(String::as_str), Some("/tmp/policy.json"));

        let cfg = BrokerConfig::from_kv(&kv).expect("config should load");
        assert!(cfg.verbose);
    }

    #[test]
    fn path_helpers_follow_xdg_layout() {
        std::env::set_var("XDG_CONFIG_HOME", "/tmp/xdg-test");
        let path = default_policy_path().expect("policy path should resolve");
        assert_eq!(path, Path::new("/tmp/xdg-test/gog-warden/policy.json"));
        let path = default_config_path().expect("config path should resolve");
        assert_eq!(path, Path::new("/tmp/xdg-test/gog-warden/warden.conf"));
        std::env::remove_var("XDG_CONFIG_HOME");
    }

    #[test]
    fn ensure_config_dir_creates_parents() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("nested").join("policy.json");
        ensure_config_dir(&path).expect("parent should be created");
        assert!(path.parent().expect("parent should exist").is_dir());
    }

    #[test]
    fn broken_config_lines_fail() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("warden.conf");
        std::fs::write(&path, "NOT A PAIR\n").expect("config file should be written");
        let err = parse_env_file(path.to_string_lossy().as_ref()).unwrap_err();
        assert_eq!(err.code, "ERR_CONFIG_FILE_PARSE");
    }
}
