//! Configuration management for warden
//!
//! Handles loading and validation of `warden.toml`, followed by
//! environment-level overrides for the deployment inputs (storage location,
//! ports, enforcement interval).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;

/// Placeholder replaced by the config path in `proxy.args`.
pub const CONFIG_PLACEHOLDER: &str = "{config}";

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Administrative API settings
    #[serde(default)]
    pub admin: AdminConfig,

    /// Durable store settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Enforcement loop settings
    #[serde(default)]
    pub enforcer: EnforcerConfig,

    /// Supervised proxy settings
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Stats query settings
    #[serde(default)]
    pub stats: StatsConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Administrative API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Bind address
    #[serde(default = "default_admin_listen")]
    pub listen: String,

    /// Bind port
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
            port: default_admin_port(),
        }
    }
}

fn default_admin_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    8000
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory backing the blob store
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,

    /// Key of the account document
    #[serde(default = "default_storage_key")]
    pub key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
            key: default_storage_key(),
        }
    }
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/warden")
}

fn default_storage_key() -> String {
    "users.json".to_string()
}

/// Enforcement loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcerConfig {
    /// Seconds between enforcement ticks
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
        }
    }
}

impl EnforcerConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

fn default_interval_seconds() -> u64 {
    300
}

/// Supervised proxy configuration.
///
/// Besides the launch command this carries the static parts of the generated
/// proxy configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Proxy executable
    pub binary: String,
    /// Argument template; `{config}` is replaced by `config_path`
    pub args: Vec<String>,
    /// Public listening port
    pub port: u16,
    /// Where the generated configuration is written
    pub config_path: PathBuf,

    pub log_level: String,
    pub access_log: String,
    pub error_log: String,
    /// Tag shared by the stats API inbound, its routing rule and its outbound
    pub api_tag: String,
    pub api_listen: String,
    pub api_port: u16,
    pub inbound_protocol: String,
    pub inbound_tag: String,
    pub network: String,
    pub security: String,
    pub ws_path: String,
    pub direct_outbound_tag: String,
    /// Policy level assigned to every client
    pub user_level: u32,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            binary: "v2ray".to_string(),
            args: vec!["-config".to_string(), CONFIG_PLACEHOLDER.to_string()],
            port: 8080,
            config_path: PathBuf::from("/tmp/v2ray_config.json"),
            log_level: "warning".to_string(),
            access_log: "/dev/stdout".to_string(),
            error_log: "/dev/stderr".to_string(),
            api_tag: "API".to_string(),
            api_listen: "127.0.0.1".to_string(),
            api_port: 10085,
            inbound_protocol: "vmess".to_string(),
            inbound_tag: "vmess-in".to_string(),
            network: "ws".to_string(),
            security: "none".to_string(),
            ws_path: "/ws".to_string(),
            direct_outbound_tag: "direct-out".to_string(),
            user_level: 0,
        }
    }
}

/// Launch arguments with every `{config}` placeholder replaced by `config_path`.
#[must_use]
pub fn resolve_args(args: &[String], config_path: &Path) -> Vec<String> {
    let path = config_path.display().to_string();
    args.iter()
        .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &path))
        .collect()
}

impl ProxySettings {
    /// Address of the stats API inbound.
    #[must_use]
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_listen, self.api_port)
    }
}

/// Stats query configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Stats client binary; defaults to `proxy.binary`
    pub binary: Option<String>,
    /// Stats API address; defaults to `proxy.api_listen:proxy.api_port`
    pub server: Option<String>,
    /// Per-query timeout in seconds (0 = none)
    pub query_timeout_seconds: u64,
}

impl StatsConfig {
    #[must_use]
    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query_timeout_seconds > 0).then(|| Duration::from_secs(self.query_timeout_seconds))
    }
}

impl Config {
    /// Load configuration from `path` if it exists, otherwise defaults.
    ///
    /// Environment overrides are applied in both cases.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::load_from(path)?,
            Some(path) => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ReadFailed(path.display().to_string(), e.to_string())
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()).into())
    }

    /// Apply deployment overrides from the environment.
    ///
    /// `lookup` abstracts `std::env::var` so tests never touch process state.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("WARDEN_STORAGE_DIR").filter(|v| !v.is_empty()) {
            self.storage.dir = PathBuf::from(dir);
        }
        if let Some(key) = lookup("WARDEN_STORAGE_KEY").filter(|v| !v.is_empty()) {
            self.storage.key = key;
        }
        if let Some(port) = lookup("PORT").filter(|v| !v.is_empty()) {
            match port.parse::<u16>() {
                Ok(port) => self.proxy.port = port,
                Err(_) => warn!(value = %port, "Invalid PORT value, keeping {}", self.proxy.port),
            }
        }
        if let Some(port) = lookup("API_PORT").filter(|v| !v.is_empty()) {
            match port.parse::<u16>() {
                Ok(port) => self.admin.port = port,
                Err(_) => warn!(value = %port, "Invalid API_PORT value, keeping {}", self.admin.port),
            }
        }
        if let Some(secs) = lookup("TRAFFIC_CHECK_INTERVAL_SECONDS").filter(|v| !v.is_empty()) {
            match secs.parse::<u64>() {
                Ok(secs) if secs > 0 => self.enforcer.interval_seconds = secs,
                _ => warn!(
                    value = %secs,
                    "Invalid TRAFFIC_CHECK_INTERVAL_SECONDS value, keeping {}s",
                    self.enforcer.interval_seconds
                ),
            }
        }
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: &str| -> crate::Result<()> {
            Err(ConfigError::Invalid(msg.to_string()).into())
        };

        if self.admin.port == 0 {
            return invalid("admin.port must be non-zero");
        }
        if self.proxy.port == 0 {
            return invalid("proxy.port must be non-zero");
        }
        if self.proxy.api_port == 0 {
            return invalid("proxy.api_port must be non-zero");
        }
        if self.proxy.port == self.proxy.api_port {
            return invalid("proxy.port and proxy.api_port must differ");
        }
        if self.enforcer.interval_seconds == 0 {
            return invalid("enforcer.interval_seconds must be positive");
        }
        if self.storage.key.trim().is_empty() {
            return invalid("storage.key must not be empty");
        }
        if self.proxy.binary.trim().is_empty() {
            return invalid("proxy.binary must not be empty");
        }
        if !self.proxy.args.iter().any(|a| a.contains(CONFIG_PLACEHOLDER)) {
            return invalid("proxy.args must reference {config}");
        }
        Ok(())
    }

    /// Stats client binary, falling back to the proxy binary.
    #[must_use]
    pub fn stats_binary(&self) -> &str {
        self.stats.binary.as_deref().unwrap_or(&self.proxy.binary)
    }

    /// Stats API address, falling back to the proxy's API inbound.
    #[must_use]
    pub fn stats_server(&self) -> String {
        self.stats
            .server
            .clone()
            .unwrap_or_else(|| self.proxy.api_address())
    }
}
