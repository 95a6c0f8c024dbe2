use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML: {message}")]
    InvalidToml { message: String },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub rest: RestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw).map_err(|error| ConfigError::InvalidToml {
            message: error.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.account.user_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "account.user_id".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.chat.ping_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "chat.ping_interval_secs".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }
        Ok(())
    }
}

/// Credentials of the account the SDK acts as.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub user_id: String,
    pub secret: String,
    /// Identity string presented during SASL; defaults to the user id
    pub identity: Option<String>,
}

/// Chat connection settings consumed by the transport and session.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    /// WebSocket endpoint of the chat server
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// WebSocket sub-protocol token offered during the upgrade
    #[serde(default = "default_subprotocol")]
    pub subprotocol: String,

    /// Traffic silence after which the link is treated as dead
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Delay before a reconnect attempt after an orderly close
    #[serde(default = "default_reconnect_secs")]
    pub reconnect_secs: u64,

    /// Delay before a reconnect attempt after an abnormal failure
    #[serde(default = "default_error_reconnect_secs")]
    pub error_reconnect_secs: u64,

    /// Interval between keepalive pings
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Per-request correlation timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Application version embedded in the bound resource id
    #[serde(default = "default_app_version")]
    pub app_version: String,

    /// Labels for the two team sides of a match
    #[serde(default = "default_team_keys")]
    pub team_keys: [String; 2],

    /// Whether the transport reconnects on its own
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

impl ChatConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }

    pub fn error_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.error_reconnect_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            subprotocol: default_subprotocol(),
            keepalive_secs: default_keepalive_secs(),
            reconnect_secs: default_reconnect_secs(),
            error_reconnect_secs: default_error_reconnect_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            app_version: default_app_version(),
            team_keys: default_team_keys(),
            auto_reconnect: true,
        }
    }
}

/// Data-access layer surface.
#[derive(Debug, Clone, Deserialize)]
pub struct RestConfig {
    #[serde(default = "default_api_base")]
    pub base_url: String,

    /// API key sent as a bearer token
    #[serde(default)]
    pub api_key: String,

    /// Context-cache entry lifetime
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Interval of the expired-entry sweep
    #[serde(default = "default_cache_sweep_secs")]
    pub cache_sweep_secs: u64,
}

impl RestConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_secs)
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base(),
            api_key: String::new(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_sweep_secs: default_cache_sweep_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_endpoint() -> String {
    "wss://chat.arena.example.com/websocket".to_string()
}

fn default_subprotocol() -> String {
    "xmpp".to_string()
}

fn default_keepalive_secs() -> u64 {
    90
}

fn default_reconnect_secs() -> u64 {
    5
}

fn default_error_reconnect_secs() -> u64 {
    15
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_team_keys() -> [String; 2] {
    ["faction1".to_string(), "faction2".to_string()]
}

fn default_api_base() -> String {
    "https://api.arena.example.com/v1/".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_sweep_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let raw = r#"
            [account]
            user_id = "u-123"
            secret = "token"
        "#;

        let config: Config = toml::from_str(raw).expect("config should parse");
        assert_eq!(config.account.user_id, "u-123");
        assert_eq!(config.chat.subprotocol, "xmpp");
        assert_eq!(config.chat.ping_interval_secs, 30);
        assert_eq!(config.chat.team_keys[0], "faction1");
        assert!(config.chat.auto_reconnect);
    }

    #[test]
    fn overrides_are_honored() {
        let raw = r#"
            [account]
            user_id = "u-123"
            secret = "token"

            [chat]
            endpoint = "wss://chat.example.org/ws"
            keepalive_secs = 30
            team_keys = ["left", "right"]
        "#;

        let config: Config = toml::from_str(raw).expect("config should parse");
        assert_eq!(config.chat.endpoint, "wss://chat.example.org/ws");
        assert_eq!(config.chat.keepalive(), Duration::from_secs(30));
        assert_eq!(config.chat.team_keys[1], "right");
    }

    #[test]
    fn validate_rejects_empty_user_id() {
        let raw = r#"
            [account]
            user_id = "  "
            secret = "token"
        "#;

        let config: Config = toml::from_str(raw).expect("config should parse");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
