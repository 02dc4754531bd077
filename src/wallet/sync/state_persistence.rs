//! State persistence service for wallet synchronization.
//!
//! `StatePersistenceService` sits between the sync engine and a `LedgerStore`.
//! It turns recovery output into address records, answers the "what do we
//! already know" questions that recovery and balance sync ask, and commits
//! balance snapshots so a failed write never leaves a half-updated wallet.
//!
//! Secrets are sealed on the way into the store and opened on the way out.
//! Both need the `SecretSealer` installed by `unlock`; after `lock` a wallet
//! can only be saved if it already carries a sealed copy of its secret.

use crate::crypto::SecretSealer;
use crate::wallet::sync::recovery::RecoveredAddress;
use crate::wallet::sync::repositories::LedgerStore;
use crate::wallet::types::{AddressRecord, ScanKind, Wallet, WalletDelta, WalletId, WalletSyncError};

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

pub struct StatePersistenceService {
    store: Arc<dyn LedgerStore>,
    sealer: RwLock<Option<Arc<SecretSealer>>>,
}

impl StatePersistenceService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            sealer: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Install the sealer used for every later save and load.
    pub fn unlock(&self, sealer: SecretSealer) {
        *self.sealer.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(sealer));
    }

    /// Drop the sealer and with it the derived keys.
    pub fn lock(&self) {
        self.sealer.write().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub fn is_unlocked(&self) -> bool {
        self.sealer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn sealer(&self) -> Option<Arc<SecretSealer>> {
        self.sealer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The copy of `wallet` that is allowed to reach the store: no plaintext
    /// secret, and a sealed one whenever the wallet has a secret.
    fn at_rest(&self, wallet: &Wallet) -> Result<Wallet, WalletSyncError> {
        let mut stored = wallet.clone();
        if let Some(secret) = stored.secret.take() {
            match self.sealer() {
                Some(sealer) => stored.sealed_secret = Some(sealer.seal(&secret)?),
                None if stored.sealed_secret.is_some() => {}
                None => return Err(WalletSyncError::Locked),
            }
        }
        Ok(stored)
    }

    pub async fn save_wallet(&self, wallet: &Wallet) -> Result<(), WalletSyncError> {
        let stored = self.at_rest(wallet)?;
        self.store.put_wallet(&stored).await?;
        Ok(())
    }

    /// Load every wallet and open its sealed secret. Fails on a wrong password.
    pub async fn load_wallets(&self) -> Result<Vec<Wallet>, WalletSyncError> {
        let mut wallets = self.store.list_wallets().await?;
        if wallets.iter().any(|w| w.sealed_secret.is_some()) {
            let sealer = self.sealer().ok_or(WalletSyncError::Locked)?;
            for wallet in &mut wallets {
                if let Some(sealed) = &wallet.sealed_secret {
                    wallet.secret = Some(sealer.open(sealed)?);
                }
            }
        }
        info!("Loaded {} wallets from store", wallets.len());
        Ok(wallets)
    }

    pub async fn delete_wallet(&self, id: &WalletId) -> Result<(), WalletSyncError> {
        self.store.delete_wallet(id).await?;
        Ok(())
    }

    /// Indices of addresses the store already holds as used.
    pub async fn known_used_indices(&self, id: &WalletId) -> Result<BTreeSet<u64>, WalletSyncError> {
        Ok(self
            .store
            .get_addresses(id)
            .await?
            .into_iter()
            .filter(|a| a.usage.is_some())
            .filter_map(|a| a.index)
            .collect())
    }

    /// Every address of the wallet, in index order.
    pub async fn owned_addresses(&self, id: &WalletId) -> Result<Vec<String>, WalletSyncError> {
        Ok(self
            .store
            .get_addresses(id)
            .await?
            .into_iter()
            .map(|a| a.address)
            .collect())
    }

    pub async fn save_addresses(&self, records: &[AddressRecord]) -> Result<(), WalletSyncError> {
        if records.is_empty() {
            return Ok(());
        }
        self.store.put_addresses(records).await?;
        debug!("Persisted {} address records", records.len());
        Ok(())
    }

    /// Persist recovered addresses under `wallet_id`. Returns how many were written.
    pub async fn save_recovered(
        &self,
        wallet_id: &WalletId,
        recovered: &[RecoveredAddress],
    ) -> Result<usize, WalletSyncError> {
        let records: Vec<AddressRecord> = recovered
            .iter()
            .map(|r| AddressRecord {
                wallet_id: wallet_id.clone(),
                address: r.address.clone(),
                index: Some(r.index),
                unlock_conditions: r.unlock_conditions.clone(),
                usage: r.usage,
            })
            .collect();
        self.save_addresses(&records).await?;
        Ok(records.len())
    }

    /// Apply a sync result to a copy of `wallet`, persist it, and only then
    /// report the new state. On a store failure `wallet` is untouched.
    pub async fn commit_sync(
        &self,
        wallet: &Wallet,
        kind: ScanKind,
        highest_used_index: Option<u64>,
        delta: WalletDelta,
    ) -> Result<Wallet, WalletSyncError> {
        let mut updated = wallet.clone();
        updated.apply_delta(delta);
        updated.last_used_index = match (wallet.last_used_index, highest_used_index) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let now = Utc::now();
        updated.last_synced_at = Some(now);
        if kind == ScanKind::Full {
            updated.last_full_scan_at = Some(now);
        }

        self.save_wallet(&updated).await?;
        Ok(updated)
    }
}
