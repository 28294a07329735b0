//! Durable blob store gateway and the persisted account document.
//!
//! The store is a plain key/value blob interface; the account mapping is
//! stored as one pretty-printed JSON object keyed by account id.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::account::Account;
use crate::error::PersistenceError;
use crate::registry::RegistrySnapshot;

/// Store future type.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, PersistenceError>> + Send + 'a>>;

/// Durable key/value blob store.
pub trait PersistenceGateway: Send + Sync {
    /// Human-readable store location used in logs.
    fn describe(&self) -> String;

    /// Fetch a blob; `Ok(None)` when the key does not exist.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>>;

    /// Replace the blob stored under `key`.
    fn put<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> StoreFuture<'a, ()>;
}

// =============================================================================
// Filesystem store
// =============================================================================

/// Blob store backed by a local directory; one file per key.
///
/// Writes go to a uniquely named sibling temp file and are renamed into
/// place. Writers are serialized, so the stored blob is always one complete
/// write.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl FileBlobStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        let relative = Path::new(key);
        let acceptable = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !acceptable {
            return Err(PersistenceError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl PersistenceGateway for FileBlobStore {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(PersistenceError::Unavailable {
                    key: key.to_string(),
                    reason: e.to_string(),
                }),
            }
        })
    }

    fn put<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            let unavailable = |e: std::io::Error| PersistenceError::Unavailable {
                key: key.to_string(),
                reason: e.to_string(),
            };

            let _guard = self.write_lock.lock().await;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(unavailable)?;
            }
            let mut tmp_name = path.clone().into_os_string();
            tmp_name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
            let tmp_path = PathBuf::from(tmp_name);
            if let Err(e) = tokio::fs::write(&tmp_path, &bytes).await {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(unavailable(e));
            }
            if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(unavailable(e));
            }
            debug!(path = %path.display(), bytes = bytes.len(), "Blob written");
            Ok(())
        })
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Process-local blob store, used for ephemeral runs and tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fail_puts: AtomicBool,
    puts: std::sync::atomic::AtomicU64,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `put` calls fail (or succeed again).
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `put` calls.
    #[must_use]
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Raw blob currently stored under `key`.
    #[must_use]
    pub fn blob(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Store a blob without going through the async interface.
    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), bytes);
    }
}

impl PersistenceGateway for MemoryBlobStore {
    fn describe(&self) -> String {
        "memory://".to_string()
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        let blob = self.blob(key);
        Box::pin(async move { Ok(blob) })
    }

    fn put<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable {
                    key: key.to_string(),
                    reason: "writes disabled".to_string(),
                });
            }
            self.insert(key, bytes);
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

// =============================================================================
// Account document
// =============================================================================

/// Encode the snapshot as the persisted account document.
pub fn encode_accounts(key: &str, snapshot: &RegistrySnapshot) -> Result<Vec<u8>, PersistenceError> {
    let sorted: BTreeMap<&String, &Account> = snapshot.accounts().iter().collect();
    serde_json::to_vec_pretty(&sorted).map_err(|e| PersistenceError::Malformed {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Decode a persisted account document.
///
/// Records with an empty `id` take it from their map key; a record whose
/// id disagrees with its key is rejected.
pub fn decode_accounts(key: &str, bytes: &[u8]) -> Result<HashMap<String, Account>, PersistenceError> {
    let malformed = |reason: String| PersistenceError::Malformed {
        key: key.to_string(),
        reason,
    };

    let mut accounts: HashMap<String, Account> =
        serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;
    for (map_key, account) in &mut accounts {
        if account.id.is_empty() {
            account.id.clone_from(map_key);
        } else if &account.id != map_key {
            return Err(malformed(format!(
                "record keyed {map_key} carries id {}",
                account.id
            )));
        }
    }
    Ok(accounts)
}

/// Load the account mapping; a missing document yields an empty mapping.
pub async fn load_accounts(
    store: &dyn PersistenceGateway,
    key: &str,
) -> Result<HashMap<String, Account>, PersistenceError> {
    match store.get(key).await? {
        Some(bytes) => {
            let accounts = decode_accounts(key, &bytes)?;
            info!(store = %store.describe(), key, count = accounts.len(), "Loaded accounts");
            Ok(accounts)
        }
        None => {
            info!(store = %store.describe(), key, "Account document not found, starting empty");
            Ok(HashMap::new())
        }
    }
}

/// Persist a full snapshot under `key`.
pub async fn save_snapshot(
    store: &dyn PersistenceGateway,
    key: &str,
    snapshot: &RegistrySnapshot,
) -> Result<(), PersistenceError> {
    let bytes = encode_accounts(key, snapshot)?;
    store.put(key, bytes).await?;
    debug!(store = %store.describe(), key, count = snapshot.len(), "Saved accounts");
    Ok(())
}
