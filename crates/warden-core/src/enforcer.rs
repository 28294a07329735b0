//! Periodic quota enforcement.
//!
//! Each tick drains the per-account traffic counters, adds them to the
//! recorded usage and deactivates accounts that reached their traffic or
//! time limit. Metrics and persistence I/O happen on a snapshot, never under
//! the registry lock. Only deactivations restart the proxy; usage-only
//! changes are persisted without a restart.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::account::{AccountDelta, DeactivationReason};
use crate::service::ControlPlane;
use crate::stats::{MetricsGateway, TrafficDirection, counter_name};

/// Overall result of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    #[default]
    Unchanged,
    UsageChanged,
    /// At least one account was deactivated
    PolicyChanged,
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unchanged => write!(f, "unchanged"),
            Self::UsageChanged => write!(f, "usage_changed"),
            Self::PolicyChanged => write!(f, "policy_changed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deactivation {
    pub account_id: String,
    pub reason: DeactivationReason,
}

/// Summary of one enforcement tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub started_at: Option<DateTime<Utc>>,
    /// Active accounts whose counters were queried
    pub checked: usize,
    /// Accounts skipped because a counter query failed
    pub skipped: Vec<String>,
    /// Accounts with nonzero traffic this tick
    pub usage_updates: usize,
    pub bytes_added: u64,
    pub deactivations: Vec<Deactivation>,
    /// Deltas dropped because the account was deleted mid-tick
    pub vanished: Vec<String>,
    pub outcome: TickOutcome,
    /// `None` when nothing needed persisting
    pub persisted: Option<bool>,
    pub restart_generation: Option<u64>,
    pub restart_error: Option<String>,
    /// Policy changed but restarts are disabled for this enforcer
    pub restart_required: bool,
}

/// Reads counters for active accounts and applies deactivation policy.
pub struct QuotaEnforcer {
    plane: Arc<ControlPlane>,
    metrics: Arc<dyn MetricsGateway>,
    restart_on_policy_change: bool,
}

impl QuotaEnforcer {
    #[must_use]
    pub fn new(plane: Arc<ControlPlane>, metrics: Arc<dyn MetricsGateway>) -> Self {
        Self {
            plane,
            metrics,
            restart_on_policy_change: true,
        }
    }

    /// Never start or stop the proxy; a policy change only sets
    /// `restart_required` in the report. Used by one-shot ticks, which do
    /// not own a supervised proxy.
    #[must_use]
    pub fn without_restart(mut self) -> Self {
        self.restart_on_policy_change = false;
        self
    }

    pub async fn run_tick(&self) -> TickReport {
        self.run_tick_at(Utc::now()).await
    }

    /// Run one tick evaluating expiry against `now`.
    pub async fn run_tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport {
            started_at: Some(now),
            ..TickReport::default()
        };

        let snapshot = self.plane.registry().snapshot().await;
        let mut deltas = Vec::new();

        for account in snapshot.active() {
            report.checked += 1;
            let tag = account.tag();

            let usage = match self.drain_counters(&tag).await {
                Ok(bytes) => bytes,
                Err(direction) => {
                    report.skipped.push(account.id.clone());
                    warn!(account_id = %account.id, %tag, %direction, "Skipping account this tick");
                    continue;
                }
            };

            let mut projected = account.clone();
            projected.traffic_used_bytes = projected.traffic_used_bytes.saturating_add(usage);
            let deactivate = projected.deactivation_reason(now);

            if usage > 0 {
                report.usage_updates += 1;
                report.bytes_added = report.bytes_added.saturating_add(usage);
                debug!(account_id = %account.id, bytes = usage, total = projected.traffic_used_bytes, "Traffic recorded");
            }
            if let Some(reason) = deactivate {
                info!(
                    account_id = %account.id,
                    %tag,
                    %reason,
                    used_bytes = projected.traffic_used_bytes,
                    limit_bytes = projected.traffic_limit_bytes(),
                    "Deactivating account"
                );
            }
            if usage > 0 || deactivate.is_some() {
                deltas.push(AccountDelta {
                    id: account.id.clone(),
                    usage_delta: usage,
                    deactivate,
                });
            }
        }
        drop(snapshot);

        if !deltas.is_empty() {
            report.vanished = self.plane.registry().apply_deltas(&deltas).await;
        }
        for delta in &deltas {
            if report.vanished.contains(&delta.id) {
                continue;
            }
            if let Some(reason) = delta.deactivate {
                report.deactivations.push(Deactivation {
                    account_id: delta.id.clone(),
                    reason,
                });
            }
        }

        report.outcome = if !report.deactivations.is_empty() {
            TickOutcome::PolicyChanged
        } else if deltas.iter().any(|d| d.usage_delta > 0 && !report.vanished.contains(&d.id)) {
            TickOutcome::UsageChanged
        } else {
            TickOutcome::Unchanged
        };

        if report.outcome != TickOutcome::Unchanged {
            match self.plane.persist().await {
                Ok(()) => report.persisted = Some(true),
                Err(e) => {
                    report.persisted = Some(false);
                    error!(error = %e, "Persisting enforcement results failed");
                }
            }
        }

        if report.outcome == TickOutcome::PolicyChanged && !self.restart_on_policy_change {
            report.restart_required = true;
            warn!("Policy changed; proxy restart required");
        } else if report.outcome == TickOutcome::PolicyChanged {
            match self.plane.restart_proxy().await {
                Ok(restart) => report.restart_generation = Some(restart.generation),
                Err(e) => {
                    error!(error = %e, "Proxy restart after deactivation failed");
                    report.restart_error = Some(e.to_string());
                }
            }
        }

        info!(
            outcome = %report.outcome,
            checked = report.checked,
            skipped = report.skipped.len(),
            usage_updates = report.usage_updates,
            bytes_added = report.bytes_added,
            deactivations = report.deactivations.len(),
            persisted = ?report.persisted,
            generation = ?report.restart_generation,
            "Enforcement tick complete"
        );
        report
    }

    /// Drain uplink then downlink; negative readings count as zero.
    async fn drain_counters(&self, tag: &str) -> Result<u64, TrafficDirection> {
        let mut total: u64 = 0;
        for direction in TrafficDirection::ALL {
            let name = counter_name(tag, direction);
            match self.metrics.get_counter(&name, true).await {
                Ok(value) => total = total.saturating_add(value.max(0) as u64),
                Err(e) => {
                    warn!(counter = %name, error = %e, "Counter query failed");
                    return Err(direction);
                }
            }
        }
        Ok(total)
    }
}

/// Handle returned by [`spawn_enforcer`] to control the loop task.
pub struct EnforcerHandle {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl EnforcerHandle {
    /// Signal the loop to stop after any tick in progress.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the loop task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Spawn the enforcement loop. The first tick runs one full `period` after
/// the call.
#[must_use]
pub fn spawn_enforcer(enforcer: QuotaEnforcer, period: Duration) -> EnforcerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = period.as_secs(), "Enforcer started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    enforcer.run_tick().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Enforcer: shutdown signal received");
                        break;
                    }
                }
            }
        }
    });

    EnforcerHandle { task, shutdown }
}
