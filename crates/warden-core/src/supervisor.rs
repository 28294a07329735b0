//! Supervision of the proxy child process.
//!
//! All restarts go through one async mutex (the restart lock) that also owns
//! the current process handle. A restart terminates the current instance
//! without waiting for it, re-snapshots the registry, writes a freshly
//! synthesized config and starts a new instance. Each start attempt gets a
//! new generation number; a background task per instance waits for its exit
//! and only touches shared state if that instance is still current.
//!
//! There is no automatic respawn after a crash.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::config::{ProxySettings, resolve_args};
use crate::error::LifecycleError;
use crate::proxy_config::synthesize;
use crate::registry::UserRegistry;

/// Exit future type.
pub type ExitFuture<'a> = Pin<Box<dyn Future<Output = ExitInfo> + Send + 'a>>;

/// Lifecycle state of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotRunning,
    Starting,
    Running,
    Stopping,
    CrashedExited,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotRunning => "not_running",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::CrashedExited => "crashed_exited",
        };
        f.write_str(s)
    }
}

/// How a process instance ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Set when the exit status could not be collected
    pub error: Option<String>,
}

impl ExitInfo {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
            error: None,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal, &self.error) {
            (_, _, Some(err)) => write!(f, "wait failed: {err}"),
            (Some(0), _, _) => write!(f, "exited successfully"),
            (Some(code), _, _) => write!(f, "exited with code {code}"),
            (None, Some(signal), _) => write!(f, "killed by signal {signal}"),
            (None, None, None) => write!(f, "exited with unknown status"),
        }
    }
}

/// A started proxy instance.
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Ask the process to exit gracefully.
    fn signal_terminate(&self) -> Result<(), LifecycleError>;

    fn force_kill(&self) -> Result<(), LifecycleError>;

    /// Resolve once the process has exited. Called once per handle.
    fn wait(&self) -> ExitFuture<'_>;
}

/// Starts proxy instances bound to a config file.
pub trait ProcessLauncher: Send + Sync {
    fn start(&self, config_path: &Path) -> Result<Arc<dyn ProcessHandle>, LifecycleError>;
}

// =============================================================================
// tokio::process implementation
// =============================================================================

/// Launches `<binary> <args>` with `{config}` substituted.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    binary: String,
    args: Vec<String>,
}

impl CommandLauncher {
    #[must_use]
    pub fn new(binary: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &ProxySettings) -> Self {
        Self::new(settings.binary.clone(), settings.args.clone())
    }
}

impl ProcessLauncher for CommandLauncher {
    fn start(&self, config_path: &Path) -> Result<Arc<dyn ProcessHandle>, LifecycleError> {
        let args = resolve_args(&self.args, config_path);

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| LifecycleError::Spawn(format!("{}: {e}", self.binary)))?;

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, pid, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, pid, true));
        }
        debug!(binary = %self.binary, ?args, pid, "Spawned proxy process");

        Ok(Arc::new(ChildProcess {
            pid,
            child: Mutex::new(Some(child)),
            exited: Arc::new(AtomicBool::new(false)),
        }))
    }
}

async fn forward_output<R>(reader: R, pid: Option<u32>, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!(target: "proxy", pid, "{line}");
        } else {
            info!(target: "proxy", pid, "{line}");
        }
    }
}

/// Handle over a spawned child.
///
/// Signals go by pid, so once the exit has been observed they are refused
/// to avoid hitting a reused pid.
pub struct ChildProcess {
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    exited: Arc<AtomicBool>,
}

impl ChildProcess {
    fn send(&self, signal: TermSignal) -> Result<(), LifecycleError> {
        let pid = self.pid.ok_or_else(|| LifecycleError::Signal {
            pid: 0,
            reason: "process has no pid".to_string(),
        })?;
        if self.exited.load(Ordering::SeqCst) {
            return Err(LifecycleError::Signal {
                pid,
                reason: "process already exited".to_string(),
            });
        }
        send_signal(pid, signal)
    }
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn signal_terminate(&self) -> Result<(), LifecycleError> {
        self.send(TermSignal::Terminate)
    }

    fn force_kill(&self) -> Result<(), LifecycleError> {
        self.send(TermSignal::Kill)
    }

    fn wait(&self) -> ExitFuture<'_> {
        Box::pin(async move {
            let Some(mut child) = self.child.lock().await.take() else {
                return ExitInfo {
                    error: Some("exit already collected".to_string()),
                    ..ExitInfo::default()
                };
            };
            let info = match child.wait().await {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => ExitInfo {
                    error: Some(e.to_string()),
                    ..ExitInfo::default()
                },
            };
            self.exited.store(true, Ordering::SeqCst);
            info
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum TermSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: TermSignal) -> Result<(), LifecycleError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| LifecycleError::Signal {
        pid,
        reason: "pid out of range".to_string(),
    })?;
    let sig = match signal {
        TermSignal::Terminate => Signal::SIGTERM,
        TermSignal::Kill => Signal::SIGKILL,
    };
    kill(Pid::from_raw(raw), sig).map_err(|e| LifecycleError::Signal {
        pid,
        reason: e.to_string(),
    })
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: TermSignal) -> Result<(), LifecycleError> {
    Err(LifecycleError::Signal {
        pid,
        reason: "signals are only supported on unix".to_string(),
    })
}

// =============================================================================
// Supervisor
// =============================================================================

/// Outcome of a successful restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartReport {
    pub generation: u64,
    pub pid: Option<u32>,
    /// Clients written to the config (including a placeholder)
    pub clients: usize,
    pub config_path: PathBuf,
}

struct Instance {
    handle: Arc<dyn ProcessHandle>,
    generation: u64,
    retired: Arc<AtomicBool>,
    exited: watch::Receiver<bool>,
}

/// Serializes restarts and owns the current proxy instance.
pub struct ProcessSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    settings: ProxySettings,
    slot: Arc<Mutex<Option<Instance>>>,
    state: Arc<StdMutex<ProcessState>>,
    generation: Arc<AtomicU64>,
    last_exit: Arc<StdMutex<Option<ExitInfo>>>,
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("config_path", &self.settings.config_path)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(launcher: Arc<dyn ProcessLauncher>, settings: ProxySettings) -> Self {
        Self {
            launcher,
            settings,
            slot: Arc::new(Mutex::new(None)),
            state: Arc::new(StdMutex::new(ProcessState::NotRunning)),
            generation: Arc::new(AtomicU64::new(0)),
            last_exit: Arc::new(StdMutex::new(None)),
        }
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of start attempts so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Exit of the most recent instance that ended on its own.
    #[must_use]
    pub fn last_exit(&self) -> Option<ExitInfo> {
        self.last_exit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn current_pid(&self) -> Option<u32> {
        self.slot.lock().await.as_ref().and_then(|i| i.handle.pid())
    }

    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.settings.config_path
    }

    fn set_state(&self, state: ProcessState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Replace the running proxy with one configured from the registry as it
    /// is now.
    pub async fn restart(
        &self,
        registry: &UserRegistry,
        port: u16,
    ) -> Result<RestartReport, LifecycleError> {
        let mut slot = self.slot.lock().await;

        if let Some(previous) = slot.take() {
            self.set_state(ProcessState::Stopping);
            terminate(&previous);
            self.set_state(ProcessState::NotRunning);
        }

        let snapshot = registry.snapshot().await;
        let config = synthesize(&snapshot, port, &self.settings);
        let clients = config.clients().len();
        let bytes = config.to_json_bytes()?;
        write_config(&self.settings.config_path, &bytes).await?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ProcessState::Starting);
        let handle = match self.launcher.start(&self.settings.config_path) {
            Ok(handle) => handle,
            Err(e) => {
                self.set_state(ProcessState::NotRunning);
                error!(generation, error = %e, "Proxy failed to start");
                return Err(e);
            }
        };
        self.set_state(ProcessState::Running);

        let pid = handle.pid();
        let retired = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(false);
        self.spawn_exit_watch(Arc::clone(&handle), generation, Arc::clone(&retired), exit_tx);

        *slot = Some(Instance {
            handle,
            generation,
            retired,
            exited: exit_rx,
        });
        info!(generation, pid, clients, port, "Proxy started");

        Ok(RestartReport {
            generation,
            pid,
            clients,
            config_path: self.settings.config_path.clone(),
        })
    }

    /// Terminate the current instance and wait up to `grace` for it to exit,
    /// force-killing it after that. No new instance is started.
    pub async fn stop(&self, grace: Duration) {
        let mut slot = self.slot.lock().await;
        let Some(instance) = slot.take() else {
            return;
        };

        self.set_state(ProcessState::Stopping);
        terminate(&instance);
        let mut exited = instance.exited.clone();
        if tokio::time::timeout(grace, exited.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!(
                generation = instance.generation,
                grace_secs = grace.as_secs(),
                "Proxy did not exit in time, killing"
            );
            if let Err(e) = instance.handle.force_kill() {
                warn!(generation = instance.generation, error = %e, "Force kill failed");
            }
        }
        self.set_state(ProcessState::NotRunning);
        info!(generation = instance.generation, "Proxy stopped");
    }

    fn spawn_exit_watch(
        &self,
        handle: Arc<dyn ProcessHandle>,
        generation: u64,
        retired: Arc<AtomicBool>,
        exit_tx: watch::Sender<bool>,
    ) {
        let slot = Arc::clone(&self.slot);
        let state = Arc::clone(&self.state);
        let last_exit = Arc::clone(&self.last_exit);

        tokio::spawn(async move {
            let exit = handle.wait().await;
            let _ = exit_tx.send(true);
            let pid = handle.pid();

            // Same lock as restart/stop: the slot and state only change
            // together, and only while this instance is still current.
            let mut slot = slot.lock().await;
            let current = slot
                .as_ref()
                .is_some_and(|i| i.generation == generation && !retired.load(Ordering::SeqCst));
            if !current {
                debug!(generation, pid, %exit, "Retired proxy instance exited");
                return;
            }
            *slot = None;

            if exit.success() {
                info!(generation, pid, %exit, "Proxy exited");
            } else {
                error!(generation, pid, %exit, "Proxy exited unexpectedly");
            }
            *state.lock().unwrap_or_else(|e| e.into_inner()) = ProcessState::CrashedExited;
            *last_exit.lock().unwrap_or_else(|e| e.into_inner()) = Some(exit);
            *state.lock().unwrap_or_else(|e| e.into_inner()) = ProcessState::NotRunning;
        });
    }
}

/// Graceful termination, falling back to a kill. Does not wait for exit.
fn terminate(instance: &Instance) {
    instance.retired.store(true, Ordering::SeqCst);
    let generation = instance.generation;
    let pid = instance.handle.pid();
    match instance.handle.signal_terminate() {
        Ok(()) => debug!(generation, pid, "Sent terminate to proxy"),
        Err(e) => {
            warn!(generation, pid, error = %e, "Terminate failed, killing proxy");
            if let Err(e) = instance.handle.force_kill() {
                warn!(generation, pid, error = %e, "Force kill failed");
            }
        }
    }
}

/// Write the config via a temp file and rename, creating parent dirs.
async fn write_config(path: &Path, bytes: &[u8]) -> Result<(), LifecycleError> {
    let write_err = |e: std::io::Error| LifecycleError::ConfigWrite {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await.map_err(write_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(write_err)?;
    Ok(())
}
