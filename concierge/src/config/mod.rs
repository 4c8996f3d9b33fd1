//! Configuration system for the Concierge client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/concierge/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use concierge_proto::message::{Role, UserId};

use crate::session::SessionConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A setting had a value outside its allowed set.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Setting name.
        key: &'static str,
        /// Offending value.
        value: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    reconnect: ReconnectFileConfig,
    chat: ChatFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    ws_url: Option<String>,
    fallback_ws_url: Option<String>,
    api_base_url: Option<String>,
    user_id: Option<String>,
    role: Option<String>,
    connect_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    api_timeout_secs: Option<u64>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<u32>,
    max_attempts: Option<u32>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    initial_page_size: Option<u32>,
    older_page_size: Option<u32>,
    echo_window_ms: Option<u64>,
    autoscroll_threshold_px: Option<f64>,
    preload_ratio: Option<f64>,
    load_ratio: Option<f64>,
    reconcile_interval_ms: Option<u64>,
    poll_interval_secs: Option<u64>,
    event_buffer: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Reconnect policy used by the connection supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor applied to the delay after each failure.
    pub multiplier: u32,
    /// Consecutive failures tolerated before falling back to polling.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
            max_attempts: 8,
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Chat-layer tuning: pagination, echo matching, scrolling, reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    /// Size of the first history page.
    pub initial_page_size: u32,
    /// Size of each older page.
    pub older_page_size: u32,
    /// How long a pending send may wait for its server echo.
    pub echo_window: Duration,
    /// Distance from the bottom (px) within which new messages auto-scroll.
    pub autoscroll_threshold_px: f64,
    /// Scroll ratio from the top at which the next page is preloaded.
    pub preload_ratio: f64,
    /// Scroll ratio from the top at which the next page is loaded.
    pub load_ratio: f64,
    /// Minimum spacing between reconciliation refetches of one room.
    pub reconcile_interval: Duration,
    /// Polling period once the reconnect budget is exhausted.
    pub poll_interval: Duration,
    /// Capacity of the session event channel.
    pub event_buffer: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            initial_page_size: 8,
            older_page_size: 5,
            echo_window: Duration::from_secs(10),
            autoscroll_threshold_px: 100.0,
            preload_ratio: 0.4,
            load_ratio: 0.2,
            reconcile_interval: Duration::from_secs(2),
            poll_interval: Duration::from_secs(15),
            event_buffer: 256,
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Primary WebSocket endpoint.
    pub ws_url: Option<String>,
    /// Secondary WebSocket endpoint tried when the primary is unreachable.
    pub fallback_ws_url: Option<String>,
    /// Base URL of the portal's chat API.
    pub api_base_url: Option<String>,
    /// Bearer credential for the chat API.
    pub api_token: Option<String>,
    /// The user this session acts as.
    pub user_id: Option<String>,
    /// The role this session acts in.
    pub role: Role,
    /// Timeout for the WebSocket upgrade.
    pub connect_timeout: Duration,
    /// Timeout for the `CONNECTED` acknowledgment.
    pub handshake_timeout: Duration,
    /// Timeout for chat API requests.
    pub api_timeout: Duration,

    // -- Reconnect --
    /// Reconnect policy.
    pub reconnect: ReconnectConfig,

    // -- Chat --
    /// Chat-layer tuning.
    pub chat: ChatConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            fallback_ws_url: None,
            api_base_url: None,
            api_token: None,
            user_id: None,
            role: Role::EndUser,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            api_timeout: Duration::from_secs(15),
            reconnect: ReconnectConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read or
    /// parsed, or a setting has an invalid value.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let role = match cli.role.as_deref().or(file.network.role.as_deref()) {
            Some(raw) => parse_role(raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "role",
                value: raw.to_string(),
            })?,
            None => defaults.role,
        };

        let chat_defaults = defaults.chat;
        let chat = ChatConfig {
            initial_page_size: file
                .chat
                .initial_page_size
                .unwrap_or(chat_defaults.initial_page_size),
            older_page_size: file
                .chat
                .older_page_size
                .unwrap_or(chat_defaults.older_page_size),
            echo_window: file
                .chat
                .echo_window_ms
                .map_or(chat_defaults.echo_window, Duration::from_millis),
            autoscroll_threshold_px: file
                .chat
                .autoscroll_threshold_px
                .unwrap_or(chat_defaults.autoscroll_threshold_px),
            preload_ratio: file.chat.preload_ratio.unwrap_or(chat_defaults.preload_ratio),
            load_ratio: file.chat.load_ratio.unwrap_or(chat_defaults.load_ratio),
            reconcile_interval: file
                .chat
                .reconcile_interval_ms
                .map_or(chat_defaults.reconcile_interval, Duration::from_millis),
            poll_interval: file
                .chat
                .poll_interval_secs
                .map_or(chat_defaults.poll_interval, Duration::from_secs),
            event_buffer: file.chat.event_buffer.unwrap_or(chat_defaults.event_buffer),
        };
        if chat.initial_page_size == 0 || chat.older_page_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "page size",
                value: "0".to_string(),
            });
        }

        let reconnect_defaults = defaults.reconnect;
        let reconnect = ReconnectConfig {
            initial_delay: file
                .reconnect
                .initial_delay_ms
                .map_or(reconnect_defaults.initial_delay, Duration::from_millis),
            max_delay: file
                .reconnect
                .max_delay_ms
                .map_or(reconnect_defaults.max_delay, Duration::from_millis),
            multiplier: file
                .reconnect
                .multiplier
                .unwrap_or(reconnect_defaults.multiplier),
            max_attempts: file
                .reconnect
                .max_attempts
                .unwrap_or(reconnect_defaults.max_attempts),
        };

        Ok(Self {
            ws_url: cli.ws_url.clone().or_else(|| file.network.ws_url.clone()),
            fallback_ws_url: file.network.fallback_ws_url.clone(),
            api_base_url: cli
                .api_base_url
                .clone()
                .or_else(|| file.network.api_base_url.clone()),
            api_token: cli.api_token.clone(),
            user_id: cli.user_id.clone().or_else(|| file.network.user_id.clone()),
            role,
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            handshake_timeout: file
                .network
                .handshake_timeout_secs
                .map_or(defaults.handshake_timeout, Duration::from_secs),
            api_timeout: file
                .network
                .api_timeout_secs
                .map_or(defaults.api_timeout, Duration::from_secs),
            reconnect,
            chat,
        })
    }

    /// Build a [`SessionConfig`], if the user identity is configured.
    #[must_use]
    pub fn to_session_config(&self) -> Option<SessionConfig> {
        let user_id = self.user_id.clone().filter(|id| !id.is_empty())?;
        Some(SessionConfig {
            user_id: UserId::new(user_id),
            role: self.role,
            chat: self.chat.clone(),
            reconnect: self.reconnect.clone(),
        })
    }
}

/// Accepts `operator`, `end-user`, `END_USER` and similar spellings.
fn parse_role(raw: &str) -> Option<Role> {
    Role::parse(&raw.trim().to_ascii_uppercase().replace('-', "_"))
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Headless monitor for the Concierge chat session layer")]
pub struct CliArgs {
    /// WebSocket URL of the chat endpoint.
    #[arg(long, env = "CONCIERGE_WS_URL")]
    pub ws_url: Option<String>,

    /// Base URL of the portal's chat API.
    #[arg(long, env = "CONCIERGE_API_URL")]
    pub api_base_url: Option<String>,

    /// Bearer credential for the chat API.
    #[arg(long, env = "CONCIERGE_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// User id this session acts as.
    #[arg(long, env = "CONCIERGE_USER_ID")]
    pub user_id: Option<String>,

    /// Role this session acts in (`end-user` or `operator`).
    #[arg(long, env = "CONCIERGE_ROLE")]
    pub role: Option<String>,

    /// Rooms to open on startup.
    #[arg(long = "room", value_name = "CODE")]
    pub rooms: Vec<String>,

    /// Path to config file (default: `~/.config/concierge/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CONCIERGE_LOG")]
    pub log_level: String,

    /// Path to log file (default: stderr).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("concierge").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.role, Role::EndUser);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.chat.initial_page_size, 8);
        assert_eq!(config.chat.older_page_size, 5);
        assert!((config.chat.preload_ratio - 0.4).abs() < f64::EPSILON);
        assert!((config.chat.load_ratio - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.chat.reconcile_interval, Duration::from_secs(2));
        assert_eq!(config.reconnect.max_attempts, 8);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2,
            max_attempts: 5,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn toml_parsing_full() {
        let toml_str = r#"
[network]
ws_url = "wss://chat.example.com/ws"
fallback_ws_url = "wss://chat-backup.example.com/ws"
api_base_url = "https://portal.example.com/api"
user_id = "op-7"
role = "operator"
connect_timeout_secs = 30
handshake_timeout_secs = 10
api_timeout_secs = 20

[reconnect]
initial_delay_ms = 250
max_delay_ms = 8000
multiplier = 3
max_attempts = 4

[chat]
initial_page_size = 20
older_page_size = 10
echo_window_ms = 5000
autoscroll_threshold_px = 40.0
preload_ratio = 0.5
load_ratio = 0.25
reconcile_interval_ms = 3000
poll_interval_secs = 30
event_buffer = 64
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let config = ClientConfig::resolve(&CliArgs::default(), &file).unwrap();

        assert_eq!(config.ws_url.as_deref(), Some("wss://chat.example.com/ws"));
        assert_eq!(
            config.fallback_ws_url.as_deref(),
            Some("wss://chat-backup.example.com/ws")
        );
        assert_eq!(config.role, Role::Operator);
        assert_eq!(config.user_id.as_deref(), Some("op-7"));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.api_timeout, Duration::from_secs(20));
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(250));
        assert_eq!(config.reconnect.multiplier, 3);
        assert_eq!(config.reconnect.max_attempts, 4);
        assert_eq!(config.chat.initial_page_size, 20);
        assert_eq!(config.chat.echo_window, Duration::from_secs(5));
        assert_eq!(config.chat.reconcile_interval, Duration::from_secs(3));
        assert_eq!(config.chat.poll_interval, Duration::from_secs(30));
        assert_eq!(config.chat.event_buffer, 64);
    }

    #[test]
    fn toml_parsing_empty() {
        let file: ConfigFile = toml::from_str("").unwrap();
        let config = ClientConfig::resolve(&CliArgs::default(), &file).unwrap();
        assert!(config.ws_url.is_none());
        assert_eq!(config.chat, ChatConfig::default());
    }

    #[test]
    fn cli_overrides_file() {
        let toml_str = r#"
[network]
ws_url = "ws://file:9000/ws"
user_id = "file-user"
role = "END_USER"
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let cli = CliArgs {
            ws_url: Some("ws://cli:9000/ws".to_string()),
            role: Some("Operator".to_string()),
            ..Default::default()
        };
        let config = ClientConfig::resolve(&cli, &file).unwrap();

        assert_eq!(config.ws_url.as_deref(), Some("ws://cli:9000/ws"));
        assert_eq!(config.user_id.as_deref(), Some("file-user"));
        assert_eq!(config.role, Role::Operator);
    }

    #[test]
    fn invalid_role_is_rejected() {
        let cli = CliArgs {
            role: Some("admin".to_string()),
            ..Default::default()
        };
        let err = ClientConfig::resolve(&cli, &ConfigFile::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "role", .. }));
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let file: ConfigFile = toml::from_str("[chat]\nolder_page_size = 0\n").unwrap();
        assert!(ClientConfig::resolve(&CliArgs::default(), &file).is_err());
    }

    #[test]
    fn session_config_requires_user() {
        assert!(ClientConfig::default().to_session_config().is_none());
        let config = ClientConfig {
            user_id: Some("u-1".to_string()),
            role: Role::Operator,
            ..Default::default()
        };
        let session = config.to_session_config().unwrap();
        assert_eq!(session.user_id, UserId::new("u-1"));
        assert_eq!(session.role, Role::Operator);
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        assert!(load_config_file(None).is_ok());
    }

    #[test]
    fn explicit_missing_config_file_returns_error() {
        let result = load_config_file(Some(std::path::Path::new("/nonexistent/config.toml")));
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }
}
