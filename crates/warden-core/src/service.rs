//! Control plane shared by the enforcer task and the admin handlers.
//!
//! Administrative mutations follow one sequence: mutate the registry,
//! persist a fresh snapshot, then restart the proxy. A failure at the
//! persist or restart step is reported to the caller while the in-memory
//! change stays applied.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::account::{Account, AccountUpdate, NewAccount};
use crate::error::{LifecycleError, PersistenceError, Result};
use crate::persistence::{PersistenceGateway, load_accounts, save_snapshot};
use crate::registry::UserRegistry;
use crate::supervisor::{ProcessState, ProcessSupervisor, RestartReport};

/// Registry, supervisor and durable store, passed by `Arc` to every task.
pub struct ControlPlane {
    registry: UserRegistry,
    supervisor: ProcessSupervisor,
    store: Arc<dyn PersistenceGateway>,
    store_key: String,
    proxy_port: u16,
    persist_lock: tokio::sync::Mutex<()>,
}

/// Point-in-time service health.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub state: ProcessState,
    pub generation: u64,
    pub pid: Option<u32>,
    pub accounts: usize,
    pub active_accounts: usize,
}

impl ControlPlane {
    #[must_use]
    pub fn new(
        registry: UserRegistry,
        supervisor: ProcessSupervisor,
        store: Arc<dyn PersistenceGateway>,
        store_key: impl Into<String>,
        proxy_port: u16,
    ) -> Self {
        Self {
            registry,
            supervisor,
            store,
            store_key: store_key.into(),
            proxy_port,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Build a control plane whose registry is loaded from `store`.
    ///
    /// A load failure is returned to the caller; there is no partial start.
    pub async fn bootstrap(
        supervisor: ProcessSupervisor,
        store: Arc<dyn PersistenceGateway>,
        store_key: impl Into<String>,
        proxy_port: u16,
    ) -> std::result::Result<Self, PersistenceError> {
        let store_key = store_key.into();
        let accounts = load_accounts(store.as_ref(), &store_key).await?;
        Ok(Self::new(
            UserRegistry::from_accounts(accounts),
            supervisor,
            store,
            store_key,
            proxy_port,
        ))
    }

    #[must_use]
    pub fn registry(&self) -> &UserRegistry {
        &self.registry
    }

    #[must_use]
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    #[must_use]
    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    /// Persist a fresh snapshot of the registry.
    ///
    /// Snapshot and write happen under one lock, so the last write to land
    /// is always the most recent snapshot.
    pub async fn persist(&self) -> std::result::Result<(), PersistenceError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.registry.snapshot().await;
        save_snapshot(self.store.as_ref(), &self.store_key, &snapshot).await
    }

    /// Restart the proxy from the current registry contents.
    pub async fn restart_proxy(&self) -> std::result::Result<RestartReport, LifecycleError> {
        self.supervisor.restart(&self.registry, self.proxy_port).await
    }

    /// Stop the proxy for daemon shutdown.
    pub async fn shutdown(&self, grace: Duration) {
        self.supervisor.stop(grace).await;
    }

    pub async fn health(&self) -> Health {
        let snapshot = self.registry.snapshot().await;
        Health {
            state: self.supervisor.state(),
            generation: self.supervisor.generation(),
            pid: self.supervisor.current_pid().await,
            accounts: snapshot.len(),
            active_accounts: snapshot.active().len(),
        }
    }

    pub async fn list_accounts(&self) -> Vec<Account> {
        self.registry.list().await
    }

    pub async fn get_account(&self, id: &str) -> Result<Account> {
        self.registry.get(id).await
    }

    #[instrument(skip(self, request), fields(account_id))]
    pub async fn create_account(&self, request: NewAccount) -> Result<Account> {
        let account = Account::create(&request, Utc::now())?;
        tracing::Span::current().record("account_id", account.id.as_str());
        self.registry.upsert(account.clone()).await;
        info!(
            traffic_limit_gb = account.traffic_limit_gb,
            time_limit_days = account.time_limit_days,
            "Account created"
        );
        self.commit().await?;
        Ok(account)
    }

    #[instrument(skip(self, update))]
    pub async fn update_account(&self, account_id: &str, update: AccountUpdate) -> Result<Account> {
        update.validate()?;
        let account = self
            .registry
            .update(account_id, |account| update.apply_to(account))
            .await?;
        info!(is_active = account.is_active, "Account updated");
        self.commit().await?;
        Ok(account)
    }

    #[instrument(skip(self))]
    pub async fn delete_account(&self, account_id: &str) -> Result<Account> {
        let account = self.registry.delete(account_id).await?;
        info!("Account deleted");
        self.commit().await?;
        Ok(account)
    }

    /// Persist, then restart; the registry change is kept either way.
    async fn commit(&self) -> Result<()> {
        if let Err(e) = self.persist().await {
            error!(error = %e, "Persisting accounts failed, proxy not restarted");
            return Err(e.into());
        }
        match self.restart_proxy().await {
            Ok(report) => {
                info!(generation = report.generation, pid = report.pid, "Proxy reconfigured");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Proxy restart after admin change failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxySettings;
    use crate::error::Error;
    use crate::persistence::MemoryBlobStore;
    use crate::supervisor::{ExitFuture, ExitInfo, ProcessHandle, ProcessLauncher};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct IdleHandle;

    impl ProcessHandle for IdleHandle {
        fn pid(&self) -> Option<u32> {
            Some(42)
        }
        fn signal_terminate(&self) -> std::result::Result<(), LifecycleError> {
            Ok(())
        }
        fn force_kill(&self) -> std::result::Result<(), LifecycleError> {
            Ok(())
        }
        fn wait(&self) -> ExitFuture<'_> {
            Box::pin(std::future::pending::<ExitInfo>())
        }
    }

    #[derive(Default)]
    struct Launcher {
        fail: AtomicBool,
    }

    impl ProcessLauncher for Launcher {
        fn start(
            &self,
            _config_path: &Path,
        ) -> std::result::Result<Arc<dyn ProcessHandle>, LifecycleError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(LifecycleError::Spawn("boom".to_string()));
            }
            Ok(Arc::new(IdleHandle))
        }
    }

    struct Fixture {
        plane: ControlPlane,
        store: Arc<MemoryBlobStore>,
        launcher: Arc<Launcher>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let launcher = Arc::new(Launcher::default());
        let settings = ProxySettings {
            config_path: dir.path().join("proxy.json"),
            ..ProxySettings::default()
        };
        let supervisor = ProcessSupervisor::new(launcher.clone(), settings);
        let plane = ControlPlane::new(UserRegistry::new(), supervisor, store.clone(), "users.json", 8080);
        Fixture {
            plane,
            store,
            launcher,
            _dir: dir,
        }
    }

    fn request(gb: f64, days: i64) -> NewAccount {
        NewAccount {
            traffic_limit_gb: gb,
            time_limit_days: days,
        }
    }

    #[tokio::test]
    async fn create_persists_and_restarts() {
        let fx = fixture();
        let account = fx.plane.create_account(request(5.0, 30)).await.unwrap();

        assert_eq!(fx.store.put_count(), 1);
        assert_eq!(fx.plane.supervisor().generation(), 1);
        let saved: serde_json::Value =
            serde_json::from_slice(&fx.store.blob("users.json").unwrap()).unwrap();
        assert_eq!(saved[&account.id]["traffic_limit_gb"], 5.0);
    }

    #[tokio::test]
    async fn invalid_create_changes_nothing() {
        let fx = fixture();
        let err = fx.plane.create_account(request(0.0, 30)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(fx.plane.list_accounts().await.is_empty());
        assert_eq!(fx.store.put_count(), 0);
        assert_eq!(fx.plane.supervisor().generation(), 0);
    }

    #[tokio::test]
    async fn persistence_failure_skips_restart_but_keeps_change() {
        let fx = fixture();
        fx.store.set_fail_puts(true);
        let err = fx.plane.create_account(request(1.0, 1)).await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert_eq!(fx.plane.list_accounts().await.len(), 1);
        assert_eq!(fx.plane.supervisor().generation(), 0);
    }

    #[tokio::test]
    async fn restart_failure_is_reported_after_persisting() {
        let fx = fixture();
        fx.launcher.fail.store(true, Ordering::SeqCst);
        let err = fx.plane.create_account(request(1.0, 1)).await.unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
        assert_eq!(fx.store.put_count(), 1);
    }

    #[tokio::test]
    async fn update_and_delete_unknown_are_not_found() {
        let fx = fixture();
        assert!(matches!(
            fx.plane.update_account("nope", AccountUpdate::default()).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            fx.plane.delete_account("nope").await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(fx.store.put_count(), 0);
    }

    #[tokio::test]
    async fn update_applies_partial_fields() {
        let fx = fixture();
        let account = fx.plane.create_account(request(1.0, 30)).await.unwrap();
        let updated = fx
            .plane
            .update_account(
                &account.id,
                AccountUpdate {
                    traffic_limit_gb: Some(-3.0),
                    is_active: Some(false),
                    ..AccountUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.traffic_limit_gb, 1.0);
        assert!(!updated.is_active);
        assert_eq!(fx.plane.supervisor().generation(), 2);
    }

    #[tokio::test]
    async fn bootstrap_loads_from_store() {
        let fx = fixture();
        let account = fx.plane.create_account(request(1.0, 30)).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(
            Arc::new(Launcher::default()),
            ProxySettings {
                config_path: dir.path().join("proxy.json"),
                ..ProxySettings::default()
            },
        );
        let plane = ControlPlane::bootstrap(supervisor, fx.store.clone(), "users.json", 8080)
            .await
            .unwrap();
        assert_eq!(plane.get_account(&account.id).await.unwrap(), account);

        let health = plane.health().await;
        assert_eq!(health.accounts, 1);
        assert_eq!(health.state, ProcessState::NotRunning);
    }

    #[tokio::test]
    async fn bootstrap_fails_on_malformed_document() {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert("users.json", b"[1, 2".to_vec());
        let supervisor =
            ProcessSupervisor::new(Arc::new(Launcher::default()), ProxySettings::default());
        let result = ControlPlane::bootstrap(supervisor, store, "users.json", 8080).await;
        assert!(matches!(result, Err(PersistenceError::Malformed { .. })));
    }
}
