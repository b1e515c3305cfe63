//! Account and proxy inventory

use async_trait::async_trait;
use fleet_proto::{Account, Proxy};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Errors returned by inventory implementations
#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("No account available")]
    NoAccountAvailable,

    #[error("No proxy available")]
    NoProxyAvailable,

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Unknown proxy: {0}")]
    UnknownProxy(u64),

    #[error("Failed to import accounts: {0}")]
    Import(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result of a maintenance sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed_proxies: usize,
    pub banned_accounts: usize,
    pub flagged_accounts: usize,
}

/// Authoritative store of accounts and proxies.
///
/// `get_*` atomically claim a record (mark it used) and hand out a copy;
/// `return_*` release the claim; `update_*` overwrite the flags of the stored
/// record with those of the copy.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Claim an account that is neither used, banned nor flagged
    async fn get_account(&self) -> Result<Account, InventoryError>;

    /// Release a claimed account
    async fn return_account(&self, account: &Account) -> Result<(), InventoryError>;

    /// Persist the flags of an account
    async fn update_account(&self, account: &Account) -> Result<(), InventoryError>;

    /// Claim a proxy that is neither in use nor dead
    async fn get_proxy(&self) -> Result<Proxy, InventoryError>;

    /// Release a claimed proxy
    async fn return_proxy(&self, proxy: &Proxy) -> Result<(), InventoryError>;

    /// Persist the flags of a proxy
    async fn update_proxy(&self, proxy: &Proxy) -> Result<(), InventoryError>;

    /// Whether the stored proxy is dead. A record that is gone (swept or
    /// dropped) counts as dead.
    async fn is_proxy_dead(&self, id: u64) -> Result<bool, InventoryError>;

    /// Create or replace a proxy record
    async fn add_proxy(&self, proxy: Proxy) -> Result<(), InventoryError>;

    /// Highest proxy id ever stored (0 if none)
    async fn max_proxy_id(&self) -> Result<u64, InventoryError>;

    /// Drop every proxy record
    async fn drop_proxies(&self) -> Result<(), InventoryError>;

    /// Remove dead proxies and report unusable accounts
    async fn sweep(&self) -> Result<SweepReport, InventoryError>;
}

#[derive(Default)]
struct InventoryState {
    accounts: Vec<Account>,
    proxies: BTreeMap<u64, Proxy>,
    max_proxy_id: u64,
}

/// In-memory inventory (default implementation)
#[derive(Default)]
pub struct InMemoryInventory {
    state: Mutex<InventoryState>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an inventory pre-filled with accounts
    pub fn with_accounts(accounts: Vec<Account>) -> Self {
        Self {
            state: Mutex::new(InventoryState {
                accounts,
                ..Default::default()
            }),
        }
    }

    /// Add accounts, skipping usernames that are already known
    pub async fn add_accounts(&self, accounts: Vec<Account>) -> usize {
        let mut state = self.state.lock().await;
        let mut added = 0;
        for account in accounts {
            if state
                .accounts
                .iter()
                .any(|known| known.username == account.username)
            {
                warn!(account = %account.username, "Skipping duplicate account");
                continue;
            }
            state.accounts.push(account);
            added += 1;
        }
        added
    }

    /// Bulk import accounts from a JSON array of `{username, password, provider}`
    pub async fn import_accounts(&self, path: &Path) -> Result<usize, InventoryError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| InventoryError::Import(format!("{}: {}", path.display(), e)))?;
        let accounts: Vec<Account> = serde_json::from_str(&raw)
            .map_err(|e| InventoryError::Import(format!("{}: {}", path.display(), e)))?;

        let added = self.add_accounts(accounts).await;
        info!(path = %path.display(), added, "Imported accounts");
        Ok(added)
    }

    /// Copy of a stored account
    pub async fn account(&self, username: &str) -> Option<Account> {
        let state = self.state.lock().await;
        state
            .accounts
            .iter()
            .find(|a| a.username == username)
            .cloned()
    }

    /// Copy of a stored proxy
    pub async fn proxy(&self, id: u64) -> Option<Proxy> {
        self.state.lock().await.proxies.get(&id).copied()
    }

    pub async fn account_count(&self) -> usize {
        self.state.lock().await.accounts.len()
    }

    pub async fn proxy_count(&self) -> usize {
        self.state.lock().await.proxies.len()
    }
}

#[async_trait]
impl Inventory for InMemoryInventory {
    async fn get_account(&self) -> Result<Account, InventoryError> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .iter_mut()
            .find(|a| !a.used && !a.is_unusable())
            .ok_or(InventoryError::NoAccountAvailable)?;

        account.used = true;
        debug!(account = %account.username, "Claimed account");
        Ok(account.clone())
    }

    async fn return_account(&self, account: &Account) -> Result<(), InventoryError> {
        let mut state = self.state.lock().await;
        let stored = state
            .accounts
            .iter_mut()
            .find(|a| a.username == account.username)
            .ok_or_else(|| InventoryError::UnknownAccount(account.username.clone()))?;

        stored.used = false;
        debug!(account = %account.username, "Released account");
        Ok(())
    }

    async fn update_account(&self, account: &Account) -> Result<(), InventoryError> {
        let mut state = self.state.lock().await;
        let stored = state
            .accounts
            .iter_mut()
            .find(|a| a.username == account.username)
            .ok_or_else(|| InventoryError::UnknownAccount(account.username.clone()))?;

        stored.used = account.used;
        // Bans and flags only ever go one way outside of maintenance
        stored.banned |= account.banned;
        stored.captcha_flagged |= account.captcha_flagged;
        Ok(())
    }

    async fn get_proxy(&self) -> Result<Proxy, InventoryError> {
        let mut state = self.state.lock().await;
        let proxy = state
            .proxies
            .values_mut()
            .find(|p| !p.in_use && !p.dead)
            .ok_or(InventoryError::NoProxyAvailable)?;

        proxy.in_use = true;
        debug!(proxy_id = proxy.id, "Claimed proxy");
        Ok(*proxy)
    }

    async fn return_proxy(&self, proxy: &Proxy) -> Result<(), InventoryError> {
        let mut state = self.state.lock().await;
        let stored = state
            .proxies
            .get_mut(&proxy.id)
            .ok_or(InventoryError::UnknownProxy(proxy.id))?;

        stored.in_use = false;
        Ok(())
    }

    async fn update_proxy(&self, proxy: &Proxy) -> Result<(), InventoryError> {
        let mut state = self.state.lock().await;
        let stored = state
            .proxies
            .get_mut(&proxy.id)
            .ok_or(InventoryError::UnknownProxy(proxy.id))?;

        stored.in_use = proxy.in_use;
        // A dead proxy stays dead; concurrent writers only ever set it
        stored.dead |= proxy.dead;
        Ok(())
    }

    async fn is_proxy_dead(&self, id: u64) -> Result<bool, InventoryError> {
        let state = self.state.lock().await;
        Ok(state.proxies.get(&id).map_or(true, |p| p.dead))
    }

    async fn add_proxy(&self, proxy: Proxy) -> Result<(), InventoryError> {
        let mut state = self.state.lock().await;
        state.max_proxy_id = state.max_proxy_id.max(proxy.id);
        state.proxies.insert(proxy.id, proxy);
        debug!(proxy_id = proxy.id, "Stored proxy");
        Ok(())
    }

    async fn max_proxy_id(&self) -> Result<u64, InventoryError> {
        Ok(self.state.lock().await.max_proxy_id)
    }

    async fn drop_proxies(&self) -> Result<(), InventoryError> {
        let mut state = self.state.lock().await;
        let dropped = state.proxies.len();
        state.proxies.clear();
        info!(dropped, "Dropped proxy records");
        Ok(())
    }

    async fn sweep(&self) -> Result<SweepReport, InventoryError> {
        let mut state = self.state.lock().await;
        let before = state.proxies.len();
        state.proxies.retain(|_, p| !p.dead);

        let report = SweepReport {
            removed_proxies: before - state.proxies.len(),
            banned_accounts: state.accounts.iter().filter(|a| a.banned).count(),
            flagged_accounts: state.accounts.iter().filter(|a| a.captcha_flagged).count(),
        };
        info!(
            removed_proxies = report.removed_proxies,
            banned_accounts = report.banned_accounts,
            flagged_accounts = report.flagged_accounts,
            at = %chrono::Utc::now(),
            "Inventory sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn accounts(names: &[&str]) -> Vec<Account> {
        names
            .iter()
            .map(|n| Account::new(*n, "secret", "ptc"))
            .collect()
    }

    #[tokio::test]
    async fn test_get_account_claims_once() {
        let inventory = InMemoryInventory::with_accounts(accounts(&["a1"]));

        let account = inventory.get_account().await.unwrap();
        assert!(account.used);
        assert!(matches!(
            inventory.get_account().await,
            Err(InventoryError::NoAccountAvailable)
        ));

        inventory.return_account(&account).await.unwrap();
        assert!(!inventory.account("a1").await.unwrap().used);
        assert!(inventory.get_account().await.is_ok());
    }

    #[tokio::test]
    async fn test_banned_and_flagged_accounts_are_skipped() {
        let mut list = accounts(&["banned", "flagged", "ok"]);
        list[0].banned = true;
        list[1].captcha_flagged = true;
        let inventory = InMemoryInventory::with_accounts(list);

        let account = inventory.get_account().await.unwrap();
        assert_eq!(account.username, "ok");
    }

    #[tokio::test]
    async fn test_update_account_keeps_ban() {
        let inventory = InMemoryInventory::with_accounts(accounts(&["a1"]));
        let mut account = inventory.get_account().await.unwrap();

        account.banned = true;
        inventory.update_account(&account).await.unwrap();
        account.banned = false;
        inventory.update_account(&account).await.unwrap();

        assert!(inventory.account("a1").await.unwrap().banned);
    }

    #[tokio::test]
    async fn test_get_proxy_prefers_lowest_live_id() {
        let inventory = InMemoryInventory::new();
        let mut dead = Proxy::new(1);
        dead.dead = true;
        inventory.add_proxy(dead).await.unwrap();
        inventory.add_proxy(Proxy::new(3)).await.unwrap();
        inventory.add_proxy(Proxy::new(2)).await.unwrap();

        let proxy = inventory.get_proxy().await.unwrap();
        assert_eq!(proxy.id, 2);
        assert!(proxy.in_use);
        assert_eq!(inventory.get_proxy().await.unwrap().id, 3);
        assert!(matches!(
            inventory.get_proxy().await,
            Err(InventoryError::NoProxyAvailable)
        ));
    }

    #[tokio::test]
    async fn test_dead_proxy_is_never_revived_by_update() {
        let inventory = InMemoryInventory::new();
        inventory.add_proxy(Proxy::new(5)).await.unwrap();

        let mut proxy = inventory.get_proxy().await.unwrap();
        proxy.dead = true;
        inventory.update_proxy(&proxy).await.unwrap();
        proxy.dead = false;
        inventory.update_proxy(&proxy).await.unwrap();

        assert!(inventory.proxy(5).await.unwrap().dead);
        assert!(inventory.get_proxy().await.is_err());
    }

    #[tokio::test]
    async fn test_is_proxy_dead_reads_stored_record() {
        let inventory = InMemoryInventory::new();
        inventory.add_proxy(Proxy::new(1)).await.unwrap();

        assert!(!inventory.is_proxy_dead(1).await.unwrap());

        let mut proxy = Proxy::new(1);
        proxy.dead = true;
        inventory.update_proxy(&proxy).await.unwrap();
        assert!(inventory.is_proxy_dead(1).await.unwrap());

        // Unknown ids are never usable
        assert!(inventory.is_proxy_dead(7).await.unwrap());
    }

    #[tokio::test]
    async fn test_max_proxy_id_survives_drop() {
        let inventory = InMemoryInventory::new();
        inventory.add_proxy(Proxy::new(41)).await.unwrap();
        inventory.add_proxy(Proxy::new(7)).await.unwrap();
        inventory.drop_proxies().await.unwrap();

        assert_eq!(inventory.proxy_count().await, 0);
        assert_eq!(inventory.max_proxy_id().await.unwrap(), 41);
    }

    #[tokio::test]
    async fn test_sweep_removes_dead_proxies() {
        let mut list = accounts(&["a", "b", "c"]);
        list[0].banned = true;
        list[2].captcha_flagged = true;
        let inventory = InMemoryInventory::with_accounts(list);
        for id in 1..=3 {
            let mut proxy = Proxy::new(id);
            proxy.dead = id != 2;
            inventory.add_proxy(proxy).await.unwrap();
        }

        let report = inventory.sweep().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                removed_proxies: 2,
                banned_accounts: 1,
                flagged_accounts: 1,
            }
        );
        assert_eq!(inventory.proxy_count().await, 1);
    }

    #[tokio::test]
    async fn test_import_accounts_skips_duplicates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"username":"a","password":"p","provider":"ptc"}},
               {{"username":"a","password":"p","provider":"ptc"}},
               {{"username":"b","password":"p","provider":"google"}}]"#
        )
        .unwrap();

        let inventory = InMemoryInventory::new();
        let added = inventory.import_accounts(file.path()).await.unwrap();
        assert_eq!(added, 2);
        assert_eq!(inventory.account_count().await, 2);
    }

    #[tokio::test]
    async fn test_import_rejects_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let inventory = InMemoryInventory::new();
        let result = inventory.import_accounts(file.path()).await;
        assert!(matches!(result, Err(InventoryError::Import(_))));
    }
}
