//! Error types for warden-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for warden-core
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing fields in an account mutation request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown account id
    #[error("Account not found: {0}")]
    NotFound(String),

    /// Counter query against the proxied service failed
    #[error("Metrics query error: {0}")]
    Metrics(#[from] MetricsError),

    /// Durable store unreachable or payload malformed
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Proxy process could not be (re)configured or started
    #[error("Process lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error was caused by the request rather than the server.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound(_))
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Validation(_) => Some(
                Remediation::new(
                    "Send traffic_limit_gb and time_limit_days as positive numbers.",
                )
                .alternative("Omitted or zero limit fields are ignored by updates."),
            ),
            Self::NotFound(_) => Some(
                Remediation::new("List accounts and use a valid account id.")
                    .command("List accounts", "curl -s localhost:8000/users"),
            ),
            Self::Metrics(err) => Some(err.remediation()),
            Self::Persistence(err) => Some(err.remediation()),
            Self::Lifecycle(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the storage directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json"),
            ),
        }
    }
}

/// Counter query errors
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Stats client binary could not be executed
    #[error("failed to run stats client: {0}")]
    Spawn(String),

    /// Stats client exited unsuccessfully
    #[error("stats query for {name} failed: {stderr}")]
    CommandFailed { name: String, stderr: String },

    /// Reply could not be parsed
    #[error("unexpected stats reply for {name}: {reason}")]
    ParseError { name: String, reason: String },

    /// Query exceeded the configured timeout
    #[error("stats query for {name} timed out after {seconds} seconds")]
    Timeout { name: String, seconds: u64 },
}

impl MetricsError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Spawn(_) => Remediation::new(
                "Install the proxy binary and make sure it is on PATH (it doubles as the stats client).",
            )
            .command("Verify install", "v2ray version")
            .alternative("Set stats.binary in warden.toml to an absolute path."),
            Self::CommandFailed { .. } => Remediation::new(
                "The stats API rejected the query. Check that the proxy is running with the API inbound.",
            )
            .command("Render config", "warden render-config")
            .alternative("Confirm stats.server matches proxy.api_listen and proxy.api_port."),
            Self::ParseError { .. } => {
                Remediation::new("The stats client returned unexpected output; verify its version.")
                    .command("Check version", "v2ray version")
            }
            Self::Timeout { seconds, .. } => Remediation::new(format!(
                "Stats query timed out after {seconds} seconds. The proxy may be overloaded."
            ))
            .alternative("Raise stats.query_timeout_seconds or set it to 0 to disable."),
        }
    }
}

/// Durable store errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Store could not be read or written
    #[error("store unavailable for key {key}: {reason}")]
    Unavailable { key: String, reason: String },

    /// Stored payload could not be decoded or encoded
    #[error("malformed payload for key {key}: {reason}")]
    Malformed { key: String, reason: String },

    /// Key is not acceptable for this store
    #[error("invalid store key: {0}")]
    InvalidKey(String),
}

impl PersistenceError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Unavailable { .. } => Remediation::new(
                "Check that the storage directory exists and is writable, then retry.",
            )
            .alternative("Set WARDEN_STORAGE_DIR to a writable location."),
            Self::Malformed { key, .. } => Remediation::new(format!(
                "The stored account document {key} is not valid JSON. Restore it from backup."
            ))
            .command("Validate JSON", format!("python -m json.tool < {key}")),
            Self::InvalidKey(_) => Remediation::new(
                "Use a relative storage key without '..' components, e.g. users.json.",
            ),
        }
    }
}

/// Proxy process lifecycle errors
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Configuration document could not be produced
    #[error("failed to synthesize proxy config: {0}")]
    Synthesis(String),

    /// Configuration document could not be written
    #[error("failed to write proxy config to {path}: {reason}")]
    ConfigWrite { path: String, reason: String },

    /// Process could not be started
    #[error("failed to start proxy process: {0}")]
    Spawn(String),

    /// Signal delivery failed
    #[error("failed to signal proxy process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

impl LifecycleError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Synthesis(_) => Remediation::new("Inspect the generated proxy configuration.")
                .command("Render config", "warden render-config"),
            Self::ConfigWrite { path, .. } => Remediation::new(format!(
                "Make the proxy config location writable: {path}"
            ))
            .alternative("Set proxy.config_path in warden.toml."),
            Self::Spawn(_) => Remediation::new(
                "Install the proxy binary and make sure it is on PATH.",
            )
            .command("Verify install", "v2ray version")
            .alternative("Set proxy.binary in warden.toml to an absolute path."),
            Self::Signal { pid, .. } => Remediation::new(format!(
                "Process {pid} could not be signalled; it may already have exited."
            ))
            .command("Check process", format!("ps -p {pid}")),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("Check that the config file exists and is readable: {path}"))
                    .command("Show file", format!("ls -la \"{path}\""))
            }
            Self::ParseFailed(_) => Remediation::new("Fix the TOML syntax in warden.toml.")
                .alternative("Remove the file to fall back to built-in defaults."),
            Self::Invalid(_) => Remediation::new("Correct the reported value in warden.toml.")
                .alternative("Environment overrides (PORT, API_PORT, ...) also feed validation."),
        }
    }
}
