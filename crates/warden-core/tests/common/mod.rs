//! Shared fakes for warden-core integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use warden_core::account::Account;
use warden_core::config::ProxySettings;
use warden_core::error::{LifecycleError, MetricsError};
use warden_core::persistence::MemoryBlobStore;
use warden_core::registry::UserRegistry;
use warden_core::service::ControlPlane;
use warden_core::stats::{MetricsFuture, MetricsGateway, TrafficDirection, counter_name};
use warden_core::supervisor::{ExitFuture, ExitInfo, ProcessHandle, ProcessLauncher, ProcessSupervisor};

pub const STORE_KEY: &str = "users.json";

/// Counter source with per-counter scripted readings.
#[derive(Default)]
pub struct ScriptedMetrics {
    values: Mutex<HashMap<String, i64>>,
    failing: Mutex<Vec<String>>,
    pub queries: AtomicUsize,
}

impl ScriptedMetrics {
    pub fn set_traffic(&self, id: &str, uplink: i64, downlink: i64) {
        let tag = format!("user_{id}");
        let mut values = self.values.lock().unwrap();
        values.insert(counter_name(&tag, TrafficDirection::Uplink), uplink);
        values.insert(counter_name(&tag, TrafficDirection::Downlink), downlink);
    }

    pub fn fail_for(&self, id: &str) {
        self.failing.lock().unwrap().push(format!("user_{id}"));
    }
}

impl MetricsGateway for ScriptedMetrics {
    fn get_counter<'a>(&'a self, name: &'a str, reset: bool) -> MetricsFuture<'a> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing
            .lock()
            .unwrap()
            .iter()
            .any(|tag| name.contains(&format!(">>>{tag}>>>")));
        let value = if reset {
            self.values.lock().unwrap().remove(name).unwrap_or(0)
        } else {
            self.values.lock().unwrap().get(name).copied().unwrap_or(0)
        };
        Box::pin(async move {
            if failing {
                return Err(MetricsError::CommandFailed {
                    name: name.to_string(),
                    stderr: "connection refused".to_string(),
                });
            }
            Ok(value)
        })
    }
}

/// Handle that never exits on its own.
pub struct ParkedHandle {
    pid: u32,
}

impl ProcessHandle for ParkedHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn signal_terminate(&self) -> Result<(), LifecycleError> {
        Ok(())
    }

    fn force_kill(&self) -> Result<(), LifecycleError> {
        Ok(())
    }

    fn wait(&self) -> ExitFuture<'_> {
        Box::pin(std::future::pending::<ExitInfo>())
    }
}

/// Launcher that records every start and optionally dwells inside it.
#[derive(Default)]
pub struct RecordingLauncher {
    pub next_pid: AtomicU32,
    pub starts: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub configs: Mutex<Vec<serde_json::Value>>,
    pub dwell: Option<Duration>,
}

impl ProcessLauncher for RecordingLauncher {
    fn start(&self, config_path: &Path) -> Result<Arc<dyn ProcessHandle>, LifecycleError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let bytes = std::fs::read(config_path).map_err(|e| LifecycleError::Spawn(e.to_string()))?;
        let doc = serde_json::from_slice(&bytes).map_err(|e| LifecycleError::Spawn(e.to_string()))?;
        self.configs.lock().unwrap().push(doc);
        if let Some(dwell) = self.dwell {
            std::thread::sleep(dwell);
        }

        self.starts.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let pid = 2000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ParkedHandle { pid }))
    }
}

impl RecordingLauncher {
    /// Client emails in the most recently written config.
    pub fn last_client_tags(&self) -> Vec<String> {
        let configs = self.configs.lock().unwrap();
        let Some(doc) = configs.last() else {
            return Vec::new();
        };
        doc["inbounds"][0]["settings"]["clients"]
            .as_array()
            .map(|clients| {
                clients
                    .iter()
                    .filter_map(|c| c["email"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub fn account(id: &str, limit_gb: f64, days: i64, created_at: DateTime<Utc>, used: u64) -> Account {
    Account {
        id: id.to_string(),
        traffic_limit_gb: limit_gb,
        time_limit_days: days,
        created_at,
        traffic_used_bytes: used,
        is_active: true,
    }
}

pub struct Harness {
    pub plane: Arc<ControlPlane>,
    pub store: Arc<MemoryBlobStore>,
    pub launcher: Arc<RecordingLauncher>,
    pub metrics: Arc<ScriptedMetrics>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self::with_launcher(accounts, RecordingLauncher::default())
    }

    pub fn with_launcher(accounts: Vec<Account>, launcher: RecordingLauncher) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let launcher = Arc::new(launcher);
        let settings = ProxySettings {
            config_path: dir.path().join("proxy").join("config.json"),
            ..ProxySettings::default()
        };
        let supervisor = ProcessSupervisor::new(launcher.clone(), settings);
        let registry =
            UserRegistry::from_accounts(accounts.into_iter().map(|a| (a.id.clone(), a)).collect());
        let plane = Arc::new(ControlPlane::new(
            registry,
            supervisor,
            store.clone(),
            STORE_KEY,
            8080,
        ));
        Self {
            plane,
            store,
            launcher,
            metrics: Arc::new(ScriptedMetrics::default()),
            _dir: dir,
        }
    }

    /// Accounts as last persisted.
    pub fn persisted(&self) -> HashMap<String, Account> {
        let bytes = self.store.blob(STORE_KEY).expect("document persisted");
        serde_json::from_slice(&bytes).unwrap()
    }
}
