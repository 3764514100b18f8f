//! Connected apps per wallet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::vault::Vault;
use crate::crypto::{SessionCrypto, SessionKeyPair};
use crate::error::StorageError;
use crate::protocol::Manifest;
use crate::wallet::WalletAddress;

const APPS_KEY_PREFIX: &str = "tonconnect.apps.";

/// An app a wallet is connected to. Replaced wholesale on reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedApp {
    pub client_id: String,
    pub manifest: Manifest,
    pub key_pair: SessionKeyPair,
    pub connected_at: DateTime<Utc>,
}

impl ConnectedApp {
    pub fn session(&self) -> SessionCrypto {
        SessionCrypto::from(self.key_pair.clone())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AppSet {
    apps: Vec<ConnectedApp>,
}

/// Vault-backed registry. Every mutation is a read-modify-write of the whole
/// set under a per-wallet lock.
pub struct AppRegistry {
    vault: Arc<dyn Vault>,
    locks: Mutex<HashMap<WalletAddress, Arc<tokio::sync::Mutex<()>>>>,
}

impl AppRegistry {
    pub fn new(vault: Arc<dyn Vault>) -> Self {
        Self {
            vault,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn record_key(wallet: &WalletAddress) -> String {
        format!("{APPS_KEY_PREFIX}{}", wallet.to_raw())
    }

    fn wallet_lock(&self, wallet: &WalletAddress) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map holds an idle lock.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(*wallet).or_default().clone()
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn load_set(&self, wallet: &WalletAddress) -> Result<AppSet, StorageError> {
        let key = Self::record_key(wallet);
        match self.vault.load(&key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                key,
                reason: e.to_string(),
            }),
            None => Ok(AppSet::default()),
        }
    }

    async fn save_set(&self, wallet: &WalletAddress, set: &AppSet) -> Result<(), StorageError> {
        let key = Self::record_key(wallet);
        if set.apps.is_empty() {
            return self.vault.remove(&key).await;
        }
        let bytes = serde_json::to_vec(set).map_err(|e| StorageError::IoFailure {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.vault.save(&key, &bytes).await
    }

    /// Apps connected to `wallet`; empty if none were persisted.
    pub async fn get(&self, wallet: &WalletAddress) -> Result<Vec<ConnectedApp>, StorageError> {
        Ok(self.load_set(wallet).await?.apps)
    }

    pub async fn find(
        &self,
        wallet: &WalletAddress,
        client_id: &str,
    ) -> Result<Option<ConnectedApp>, StorageError> {
        Ok(self
            .get(wallet)
            .await?
            .into_iter()
            .find(|app| app.client_id == client_id))
    }

    /// Insert `app`, replacing any app with the same client id.
    pub async fn add(&self, wallet: &WalletAddress, app: ConnectedApp) -> Result<(), StorageError> {
        let lock = self.wallet_lock(wallet);
        let _guard = lock.lock().await;

        let mut set = self.load_set(wallet).await?;
        set.apps.retain(|existing| existing.client_id != app.client_id);
        let client_id = app.client_id.clone();
        set.apps.push(app);
        self.save_set(wallet, &set).await?;

        tracing::info!(wallet = %wallet, client_id = %client_id, apps = set.apps.len(), "Stored connected app");
        Ok(())
    }

    /// Remove the app with `client_id`. Returns whether one was removed.
    pub async fn remove(&self, wallet: &WalletAddress, client_id: &str) -> Result<bool, StorageError> {
        let lock = self.wallet_lock(wallet);
        let _guard = lock.lock().await;

        let mut set = self.load_set(wallet).await?;
        let before = set.apps.len();
        set.apps.retain(|existing| existing.client_id != client_id);
        if set.apps.len() == before {
            return Ok(false);
        }
        self.save_set(wallet, &set).await?;

        tracing::info!(wallet = %wallet, client_id = %client_id, "Removed connected app");
        Ok(true)
    }

    /// Drop every app of a deleted wallet.
    pub async fn remove_all(&self, wallet: &WalletAddress) -> Result<(), StorageError> {
        let lock = self.wallet_lock(wallet);
        let _guard = lock.lock().await;
        self.vault.remove(&Self::record_key(wallet)).await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::MemoryVault;

    fn manifest(name: &str) -> Manifest {
        serde_json::from_value(serde_json::json!({
            "url": "https://app.example",
            "name": name,
            "iconUrl": "https://app.example/icon.png"
        }))
        .expect("manifest")
    }

    fn app(client_id: &str, name: &str) -> ConnectedApp {
        ConnectedApp {
            client_id: client_id.to_string(),
            manifest: manifest(name),
            key_pair: SessionKeyPair::generate(),
            connected_at: Utc::now(),
        }
    }

    fn wallet() -> WalletAddress {
        WalletAddress::new(0, [6u8; 32])
    }

    #[tokio::test]
    async fn empty_registry_returns_no_apps() {
        let registry = AppRegistry::new(Arc::new(MemoryVault::new()));
        assert!(registry.get(&wallet()).await.expect("get").is_empty());
    }

    #[tokio::test]
    async fn add_is_idempotent_by_client_id() {
        let registry = AppRegistry::new(Arc::new(MemoryVault::new()));

        registry.add(&wallet(), app("aa", "First")).await.expect("add");
        registry.add(&wallet(), app("bb", "Other")).await.expect("add");
        registry.add(&wallet(), app("aa", "Second")).await.expect("add");

        let apps = registry.get(&wallet()).await.expect("get");
        let matching: Vec<_> = apps.iter().filter(|a| a.client_id == "aa").collect();
        assert_eq!(apps.len(), 2);
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].manifest.name, "Second");
    }

    #[tokio::test]
    async fn remove_missing_app_is_a_noop() {
        let registry = AppRegistry::new(Arc::new(MemoryVault::new()));
        registry.add(&wallet(), app("aa", "First")).await.expect("add");

        assert!(!registry.remove(&wallet(), "zz").await.expect("remove"));
        assert!(registry.remove(&wallet(), "aa").await.expect("remove"));
        assert!(registry.find(&wallet(), "aa").await.expect("find").is_none());
    }

    #[tokio::test]
    async fn concurrent_adds_for_one_wallet_keep_every_app() {
        let registry = Arc::new(AppRegistry::new(Arc::new(MemoryVault::new())));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .add(&wallet(), app(&format!("client-{i}"), "App"))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.expect("join").expect("add");
        }

        assert_eq!(registry.get(&wallet()).await.expect("get").len(), 16);
    }

    #[tokio::test]
    async fn idle_wallet_locks_are_pruned() {
        let registry = AppRegistry::new(Arc::new(MemoryVault::new()));
        for i in 0..10u8 {
            let wallet = WalletAddress::new(0, [i; 32]);
            registry.add(&wallet, app("aa", "App")).await.expect("add");
            registry.remove(&wallet, "aa").await.expect("remove");
        }

        assert_eq!(registry.tracked_locks(), 1);
    }

    #[tokio::test]
    async fn key_pair_survives_persistence() {
        let registry = AppRegistry::new(Arc::new(MemoryVault::new()));
        let original = app("aa", "First");
        registry.add(&wallet(), original.clone()).await.expect("add");

        let stored = registry
            .find(&wallet(), "aa")
            .await
            .expect("find")
            .expect("present");
        assert_eq!(stored.key_pair, original.key_pair);
        assert_eq!(stored.session().session_id(), original.session().session_id());
    }

    struct BrokenVault;

    #[async_trait]
    impl Vault for BrokenVault {
        async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            Err(StorageError::IoFailure {
                key: key.to_string(),
                reason: "disk gone".to_string(),
            })
        }

        async fn save(&self, key: &str, _value: &[u8]) -> Result<(), StorageError> {
            self.load(key).await.map(|_| ())
        }

        async fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.load(key).await.map(|_| ())
        }
    }

    #[tokio::test]
    async fn vault_failures_surface_as_io_failure() {
        let registry = AppRegistry::new(Arc::new(BrokenVault));
        assert!(matches!(
            registry.add(&wallet(), app("aa", "First")).await,
            Err(StorageError::IoFailure { .. })
        ));
    }
}
