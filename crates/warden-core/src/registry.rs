//! Authoritative in-memory account registry.
//!
//! Reads take the shared lock, writes the exclusive lock. Anything that
//! needs to do I/O works on a [`RegistrySnapshot`], a deep copy taken under
//! the shared lock and released before the caller continues.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::account::{Account, AccountDelta};
use crate::error::{Error, Result};

/// Lock-protected mapping of account id to account.
#[derive(Debug, Default)]
pub struct UserRegistry {
    accounts: RwLock<HashMap<String, Account>>,
}

impl UserRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the registry, e.g. from the durable store at bootstrap.
    #[must_use]
    pub fn from_accounts(accounts: HashMap<String, Account>) -> Self {
        Self {
            accounts: RwLock::new(accounts),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Account> {
        self.accounts
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// All accounts ordered by creation time, then id.
    pub async fn list(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self.accounts.read().await.values().cloned().collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        accounts
    }

    /// Insert or replace an account, returning the previous value.
    pub async fn upsert(&self, account: Account) -> Option<Account> {
        self.accounts
            .write()
            .await
            .insert(account.id.clone(), account)
    }

    pub async fn delete(&self, id: &str) -> Result<Account> {
        self.accounts
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Mutate one account in place under the exclusive lock.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<Account>
    where
        F: FnOnce(&mut Account),
    {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        mutate(account);
        Ok(account.clone())
    }

    /// Apply enforcement deltas in one exclusive section.
    ///
    /// Usage is added to whatever the live value is now, so an admin change
    /// made since the snapshot is kept. Returns the ids that no longer exist.
    pub async fn apply_deltas(&self, deltas: &[AccountDelta]) -> Vec<String> {
        let mut missing = Vec::new();
        let mut accounts = self.accounts.write().await;
        for delta in deltas {
            let Some(account) = accounts.get_mut(&delta.id) else {
                missing.push(delta.id.clone());
                continue;
            };
            account.traffic_used_bytes = account.traffic_used_bytes.saturating_add(delta.usage_delta);
            if delta.deactivate.is_some() {
                account.is_active = false;
            }
        }
        if !missing.is_empty() {
            debug!(count = missing.len(), "Dropped deltas for deleted accounts");
        }
        missing
    }

    /// Deep copy of the mapping, taken under the shared lock.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let accounts = self.accounts.read().await.clone();
        RegistrySnapshot { accounts }
    }

    pub async fn len(&self) -> usize {
        self.accounts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.accounts.read().await.is_empty()
    }
}

/// Immutable point-in-time copy of the registry.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    accounts: HashMap<String, Account>,
}

impl RegistrySnapshot {
    #[must_use]
    pub fn new(accounts: HashMap<String, Account>) -> Self {
        Self { accounts }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Account> {
        self.accounts.get(id)
    }

    /// Active accounts ordered by id.
    #[must_use]
    pub fn active(&self) -> Vec<&Account> {
        let mut active: Vec<&Account> = self.accounts.values().filter(|a| a.is_active).collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    #[must_use]
    pub fn accounts(&self) -> &HashMap<String, Account> {
        &self.accounts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
