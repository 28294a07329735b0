//! Structured logging setup.
//!
//! One global `tracing` subscriber with an `EnvFilter` and one output layer
//! per destination: stderr always, plus an optional append-only file. Both
//! destinations use the same format.
//!
//! Field names used across the crate:
//! - `account_id`, `tag`: account context
//! - `generation`, `pid`: supervised proxy instance
//! - `reason`, `outcome`: enforcement decisions
//!
//! Proxy child output is logged under the `proxy` target, so
//! `RUST_LOG=info,proxy=warn` quiets access logs without hiding ours.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub use crate::config::LogFormat;
use crate::config::GeneralConfig;

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Resolved logging settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level or filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        GeneralConfig::default().into()
    }
}

impl From<&GeneralConfig> for LogConfig {
    fn from(general: &GeneralConfig) -> Self {
        Self {
            level: general.log_level.clone(),
            format: general.log_format,
            file: general.log_file.clone(),
        }
    }
}

impl From<GeneralConfig> for LogConfig {
    fn from(general: GeneralConfig) -> Self {
        Self::from(&general)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log filter {directive:?}: {reason}")]
    InvalidLevel { directive: String, reason: String },

    #[error("cannot open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to install subscriber: {0}")]
    Install(#[from] TryInitError),
}

/// Filter from `RUST_LOG` when set and non-empty, else from `level`.
fn build_filter(level: &str, env_override: Option<&str>) -> Result<EnvFilter, LogError> {
    let directive = env_override
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(level);
    EnvFilter::try_new(directive).map_err(|e| LogError::InvalidLevel {
        directive: directive.to_string(),
        reason: e.to_string(),
    })
}

fn output_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_timer(SystemTime)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

/// Open the log file for appending; new files are owner-only on Unix, as
/// are any parent directories created for them.
fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let mut dirs = std::fs::DirBuilder::new();
        dirs.recursive(true);
        #[cfg(unix)]
        std::os::unix::fs::DirBuilderExt::mode(&mut dirs, 0o700);
        dirs.create(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);
    options.open(path)
}

/// Install the global subscriber. Only the first call succeeds.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if is_logging_initialized() {
        return Err(LogError::AlreadyInitialized);
    }

    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(&config.level, env.as_deref())?;

    let mut layers = vec![output_layer(config.format, io::stderr, true)];
    if let Some(path) = &config.file {
        let file = open_log_file(path).map_err(|source| LogError::File {
            path: path.clone(),
            source,
        })?;
        layers.push(output_layer(config.format, Mutex::new(file), false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()?;
    let _ = LOGGING_INITIALIZED.set(());

    tracing::info!(
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}

pub fn is_logging_initialized() -> bool {
    LOGGING_INITIALIZED.get().is_some()
}
