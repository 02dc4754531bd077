//! Scan backends.
//!
//! A backend knows how to discover a wallet's addresses and how to produce a
//! balance snapshot for them. The derivation backend walks the gap-limit
//! recovery protocol against the chain data source; the remote-keystore
//! backend asks the wallet's keystore server, which owns the address list.

use crate::config::SyncConfig;
use crate::derivation::DerivationModule;
use crate::indexer::{self, ChainDataSource};
use crate::keystore::{KeystoreApi, KeystoreConnector};
use crate::wallet::sync::recovery::{
	GapLimitScanner, RecoveryProgress, RecoveryProgressHandler, RecoveryRequest,
};
use crate::wallet::sync::state_persistence::StatePersistenceService;
use crate::wallet::sync::transaction_processor::{KeystoreSnapshot, TransactionProcessor};
use crate::wallet::types::{
	AddressRecord, BackendType, Wallet, WalletDelta, WalletId, WalletKind, WalletSyncError,
};
use futures::{StreamExt, TryStreamExt, stream};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// What a discovery pass found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
	pub highest_used_index: Option<u64>,
	pub new_addresses: usize,
}

/// Discovery and balance sync for one family of wallets
#[async_trait::async_trait]
pub trait ScanBackend: Send + Sync {
	/// Discover recently used addresses near the last known frontier.
	async fn quick_scan(&self, wallet: &Wallet) -> Result<ScanReport, WalletSyncError>;

	/// Discover addresses from index 0.
	async fn full_scan(&self, wallet: &Wallet) -> Result<ScanReport, WalletSyncError>;

	/// Produce a fresh balance snapshot for every address the wallet owns.
	async fn sync_transactions_and_balance(&self, wallet: &Wallet) -> Result<WalletDelta, WalletSyncError>;

	fn name(&self) -> &'static str;
}

/// Picks the backend responsible for a wallet.
pub trait BackendSelector: Send + Sync {
	fn select(&self, wallet: &Wallet) -> Result<Arc<dyn ScanBackend>, WalletSyncError>;
}

/// Writes each recovery batch to the store as soon as it arrives.
struct AddressFlushHandler<'a> {
	persistence: &'a StatePersistenceService,
	wallet_id: &'a WalletId,
	written: usize,
	highest_used_index: Option<u64>,
}

#[async_trait::async_trait]
impl RecoveryProgressHandler for AddressFlushHandler<'_> {
	async fn on_progress(&mut self, progress: &RecoveryProgress) -> Result<(), WalletSyncError> {
		self.written += self
			.persistence
			.save_recovered(self.wallet_id, &progress.addresses)
			.await?;
		self.highest_used_index = progress.highest_used_index;
		Ok(())
	}
}

/// Backend for wallets whose addresses come from the derivation module.
pub struct DerivationBackend {
	derivation: Arc<dyn DerivationModule>,
	chain: Arc<dyn ChainDataSource>,
	persistence: Arc<StatePersistenceService>,
	processor: TransactionProcessor,
	config: SyncConfig,
}

impl DerivationBackend {
	pub fn new(
		derivation: Arc<dyn DerivationModule>,
		chain: Arc<dyn ChainDataSource>,
		persistence: Arc<StatePersistenceService>,
		config: SyncConfig,
	) -> Self {
		Self {
			derivation,
			chain,
			persistence,
			processor: TransactionProcessor::new(config.transaction_limit),
			config,
		}
	}

	async fn discover(
		&self,
		wallet: &Wallet,
		start_from_frontier: bool,
		lookahead: u64,
	) -> Result<ScanReport, WalletSyncError> {
		if !wallet.kind.can_derive() {
			debug!("Wallet {} cannot derive, skipping discovery", wallet.id);
			return Ok(ScanReport::default());
		}
		let secret = wallet
			.secret
			.as_ref()
			.ok_or_else(|| WalletSyncError::MissingSecret(wallet.id.clone()))?;

		let known_used = self.persistence.known_used_indices(&wallet.id).await?;
		let last_known = match (known_used.last().copied(), wallet.last_used_index) {
			(Some(a), Some(b)) => Some(a.max(b)),
			(a, b) => a.or(b),
		};
		let start_index = match (start_from_frontier, last_known) {
			(true, Some(used)) => used.saturating_sub(self.config.quick_lookahead),
			_ => 0,
		};

		let mut handler = AddressFlushHandler {
			persistence: &self.persistence,
			wallet_id: &wallet.id,
			written: 0,
			highest_used_index: None,
		};
		let stats = GapLimitScanner::new(self.derivation.as_ref(), self.chain.as_ref(), &self.config)
			.recover(
				RecoveryRequest {
					secret,
					currency: &wallet.currency,
					start_index,
					lookahead,
					last_known_used_index: last_known,
					known_used: &known_used,
				},
				&mut handler,
			)
			.await?;

		Ok(ScanReport {
			highest_used_index: stats.highest_used_index.or(handler.highest_used_index),
			new_addresses: handler.written,
		})
	}
}

#[async_trait::async_trait]
impl ScanBackend for DerivationBackend {
	async fn quick_scan(&self, wallet: &Wallet) -> Result<ScanReport, WalletSyncError> {
		self.discover(wallet, true, self.config.quick_lookahead).await
	}

	async fn full_scan(&self, wallet: &Wallet) -> Result<ScanReport, WalletSyncError> {
		self.discover(wallet, false, self.config.full_lookahead).await
	}

	async fn sync_transactions_and_balance(&self, wallet: &Wallet) -> Result<WalletDelta, WalletSyncError> {
		let addresses = self.persistence.owned_addresses(&wallet.id).await?;
		if addresses.is_empty() {
			debug!("Wallet {} has no addresses yet", wallet.id);
			return Ok(WalletDelta::default());
		}

		let balance = indexer::within(
			self.config.remote_timeout,
			self.chain.address_balance(&addresses),
		)
		.await?;

		let owned: HashSet<String> = addresses.into_iter().collect();
		Ok(self.processor.process_balance(balance, &owned))
	}

	fn name(&self) -> &'static str {
		"derivation"
	}
}

/// Backend for wallets whose address list lives on a keystore server.
pub struct RemoteKeystoreBackend {
	connector: Arc<dyn KeystoreConnector>,
	persistence: Arc<StatePersistenceService>,
	processor: TransactionProcessor,
	config: SyncConfig,
}

impl RemoteKeystoreBackend {
	pub fn new(
		connector: Arc<dyn KeystoreConnector>,
		persistence: Arc<StatePersistenceService>,
		config: SyncConfig,
	) -> Self {
		Self {
			connector,
			persistence,
			processor: TransactionProcessor::new(config.transaction_limit),
			config,
		}
	}

	fn client(&self, wallet: &Wallet) -> Result<Arc<dyn KeystoreApi>, WalletSyncError> {
		let server_url = wallet
			.server_url
			.as_deref()
			.ok_or(WalletSyncError::UnknownWalletType {
				kind: wallet.kind,
				backend: wallet.backend,
			})?;
		Ok(self.connector.connect(server_url)?)
	}

	/// Pull the server's address list and persist any addresses not yet stored.
	async fn refresh_addresses(&self, wallet: &Wallet) -> Result<ScanReport, WalletSyncError> {
		let client = self.client(wallet)?;
		let deadline = self.config.remote_timeout;

		let remote = indexer::within(deadline, client.addresses()).await?;
		let known: HashSet<String> = self
			.persistence
			.owned_addresses(&wallet.id)
			.await?
			.into_iter()
			.collect();
		let missing: Vec<String> = remote.into_iter().filter(|a| !known.contains(a)).collect();

		let records: Vec<AddressRecord> = stream::iter(missing)
			.map(|address| {
				let client = Arc::clone(&client);
				async move { indexer::within(deadline, client.address_info(&address)).await }
			})
			.buffer_unordered(self.config.keystore_concurrency.max(1))
			.map_ok(|info| AddressRecord {
				wallet_id: wallet.id.clone(),
				address: info.address,
				index: Some(info.key_index),
				unlock_conditions: Some(info.unlock_conditions),
				usage: None,
			})
			.try_collect()
			.await?;

		self.persistence.save_addresses(&records).await?;
		if !records.is_empty() {
			info!(
				"Stored {} new keystore addresses for wallet {}",
				records.len(),
				wallet.id
			);
		}

		Ok(ScanReport {
			highest_used_index: None,
			new_addresses: records.len(),
		})
	}
}

#[async_trait::async_trait]
impl ScanBackend for RemoteKeystoreBackend {
	async fn quick_scan(&self, wallet: &Wallet) -> Result<ScanReport, WalletSyncError> {
		self.refresh_addresses(wallet).await
	}

	async fn full_scan(&self, wallet: &Wallet) -> Result<ScanReport, WalletSyncError> {
		self.refresh_addresses(wallet).await
	}

	async fn sync_transactions_and_balance(&self, wallet: &Wallet) -> Result<WalletDelta, WalletSyncError> {
		let client = self.client(wallet)?;
		let deadline = self.config.remote_timeout;

		let (confirmed_balance, limbo_balance, unspent_outputs, transactions, limbo) = tokio::try_join!(
			indexer::within(deadline, client.balance(false)),
			indexer::within(deadline, client.balance(true)),
			indexer::within(deadline, client.unspent_outputs()),
			indexer::within(deadline, client.transactions(self.config.transaction_limit)),
			indexer::within(deadline, client.limbo_transactions()),
		)?;

		let owned: HashSet<String> = self
			.persistence
			.owned_addresses(&wallet.id)
			.await?
			.into_iter()
			.collect();

		Ok(self.processor.process_keystore(
			KeystoreSnapshot {
				confirmed_balance,
				limbo_balance,
				unspent_outputs,
				transactions,
				limbo,
			},
			&owned,
		))
	}

	fn name(&self) -> &'static str {
		"remote-keystore"
	}
}

/// Routes wallets to the derivation or remote-keystore backend.
pub struct BackendRegistry {
	derivation: Arc<dyn ScanBackend>,
	keystore: Arc<dyn ScanBackend>,
}

impl BackendRegistry {
	pub fn new(derivation: Arc<dyn ScanBackend>, keystore: Arc<dyn ScanBackend>) -> Self {
		Self {
			derivation,
			keystore,
		}
	}
}

impl BackendSelector for BackendRegistry {
	fn select(&self, wallet: &Wallet) -> Result<Arc<dyn ScanBackend>, WalletSyncError> {
		let unknown = || WalletSyncError::UnknownWalletType {
			kind: wallet.kind,
			backend: wallet.backend,
		};
		if wallet.kind == WalletKind::Unknown {
			return Err(unknown());
		}
		match wallet.backend {
			BackendType::Derivation => Ok(Arc::clone(&self.derivation)),
			BackendType::RemoteKeystore if wallet.server_url.is_some() => Ok(Arc::clone(&self.keystore)),
			_ => Err(unknown()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::indexer::{AddressBalance, RemoteError};
	use crate::wallet::sync::repositories::{LedgerStore, MemoryLedgerStore};
	use crate::wallet::sync::test_support::{
		FailingStore, MockChain, MockConnector, MockDerivation, MockKeystore,
	};
	use crate::wallet::types::{SecretMaterial, UsageType};
	use std::time::Duration;

	fn config() -> SyncConfig {
		SyncConfig {
			quick_lookahead: 20,
			full_lookahead: 20,
			batch_size: 5,
			..Default::default()
		}
	}

	fn derivation_backend(
		chain: Arc<MockChain>,
		store: Arc<dyn LedgerStore>,
		config: SyncConfig,
	) -> (DerivationBackend, Arc<StatePersistenceService>) {
		let persistence = Arc::new(StatePersistenceService::new(store));
		let backend = DerivationBackend::new(
			Arc::new(MockDerivation::new()),
			chain,
			Arc::clone(&persistence),
			config,
		);
		(backend, persistence)
	}

	#[tokio::test]
	async fn full_scan_persists_used_addresses() {
		let chain = Arc::new(MockChain::new());
		chain.mark_used(2, UsageType::Received);
		chain.mark_used(9, UsageType::Received);
		let (backend, persistence) =
			derivation_backend(Arc::clone(&chain), Arc::new(MemoryLedgerStore::new()), config());
		let wallet = Wallet::derived("w", SecretMaterial::new("seed"), "sc");

		let report = backend.full_scan(&wallet).await.unwrap();

		assert_eq!(report.highest_used_index, Some(9));
		assert_eq!(report.new_addresses, 2);
		let known = persistence.known_used_indices(&wallet.id).await.unwrap();
		assert_eq!(known.into_iter().collect::<Vec<_>>(), vec![2, 9]);
	}

	#[tokio::test]
	async fn quick_scan_starts_one_lookahead_behind_last_used() {
		let chain = Arc::new(MockChain::new());
		chain.mark_used(100, UsageType::Received);
		let (backend, _) =
			derivation_backend(Arc::clone(&chain), Arc::new(MemoryLedgerStore::new()), config());
		let mut wallet = Wallet::derived("w", SecretMaterial::new("seed"), "sc");
		wallet.last_used_index = Some(100);

		let report = backend.quick_scan(&wallet).await.unwrap();

		assert_eq!(report.highest_used_index, Some(100));
		assert_eq!(chain.min_queried_index(), Some(80));
		assert_eq!(chain.max_queried_index(), Some(120));
	}

	#[tokio::test]
	async fn non_deriving_wallets_skip_discovery() {
		let chain = Arc::new(MockChain::new());
		let (backend, _) =
			derivation_backend(Arc::clone(&chain), Arc::new(MemoryLedgerStore::new()), config());
		let wallet = Wallet::watch_only("watch", "imported set");

		let report = backend.quick_scan(&wallet).await.unwrap();
		assert_eq!(report, ScanReport::default());
		assert_eq!(chain.used_lookups(), 0);
	}

	#[tokio::test]
	async fn missing_secret_is_reported() {
		let chain = Arc::new(MockChain::new());
		let (backend, _) = derivation_backend(chain, Arc::new(MemoryLedgerStore::new()), config());
		let mut wallet = Wallet::derived("w", SecretMaterial::new("seed"), "sc");
		wallet.secret = None;

		assert!(matches!(
			backend.full_scan(&wallet).await,
			Err(WalletSyncError::MissingSecret(_))
		));
	}

	#[tokio::test]
	async fn empty_address_set_syncs_to_zero_without_remote_call() {
		let chain = Arc::new(MockChain::new());
		let (backend, _) =
			derivation_backend(Arc::clone(&chain), Arc::new(MemoryLedgerStore::new()), config());
		let wallet = Wallet::watch_only("watch", "nothing yet");

		let delta = backend.sync_transactions_and_balance(&wallet).await.unwrap();
		assert_eq!(delta, WalletDelta::default());
		assert_eq!(chain.balance_calls(), 0);
	}

	#[tokio::test]
	async fn balance_sync_uses_one_batched_query() {
		let chain = Arc::new(MockChain::new());
		chain.set_balance(AddressBalance {
			unspent_siacoins: 4_200,
			..Default::default()
		});
		let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
		let wallet = Wallet::watch_only("watch", "two addresses");
		store
			.put_addresses(&[
				AddressRecord {
					wallet_id: wallet.id.clone(),
					address: "watched-a".into(),
					index: None,
					unlock_conditions: None,
					usage: None,
				},
				AddressRecord {
					wallet_id: wallet.id.clone(),
					address: "watched-b".into(),
					index: None,
					unlock_conditions: None,
					usage: None,
				},
			])
			.await
			.unwrap();
		let (backend, _) = derivation_backend(Arc::clone(&chain), store, config());

		let delta = backend.sync_transactions_and_balance(&wallet).await.unwrap();
		assert_eq!(delta.confirmed_balance, 4_200);
		assert_eq!(chain.balance_calls(), 1);
		assert_eq!(chain.last_balance_query(), vec!["watched-a".to_string(), "watched-b".to_string()]);
	}

	#[tokio::test(start_paused = true)]
	async fn slow_explorer_times_out_as_remote_unavailable() {
		let chain = Arc::new(MockChain::new());
		chain.set_balance_delay(Duration::from_secs(3_600));
		let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
		let wallet = Wallet::watch_only("watch", "slow");
		store
			.put_addresses(&[AddressRecord {
				wallet_id: wallet.id.clone(),
				address: "watched".into(),
				index: None,
				unlock_conditions: None,
				usage: None,
			}])
			.await
			.unwrap();
		let (backend, _) = derivation_backend(chain, store, config());

		let result = backend.sync_transactions_and_balance(&wallet).await;
		assert!(matches!(
			result,
			Err(WalletSyncError::RemoteUnavailable(RemoteError::Timeout(_)))
		));
	}

	#[tokio::test]
	async fn store_failure_aborts_scan() {
		let chain = Arc::new(MockChain::new());
		chain.mark_used(1, UsageType::Received);
		let store = Arc::new(FailingStore::new());
		store.fail_address_writes(true);
		let (backend, _) = derivation_backend(chain, store, config());
		let wallet = Wallet::derived("w", SecretMaterial::new("seed"), "sc");

		assert!(matches!(
			backend.full_scan(&wallet).await,
			Err(WalletSyncError::StoreWriteFailed(_))
		));
	}

	#[tokio::test]
	async fn keystore_scan_stores_only_new_addresses() {
		let keystore = Arc::new(MockKeystore::with_addresses(&["k-0", "k-1", "k-2"]));
		let connector = Arc::new(MockConnector::new(Arc::clone(&keystore)));
		let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
		let persistence = Arc::new(StatePersistenceService::new(Arc::clone(&store)));
		let backend = RemoteKeystoreBackend::new(connector.clone(), Arc::clone(&persistence), config());
		let wallet = Wallet::derived("walrus", SecretMaterial::new("seed"), "sc")
			.with_remote_keystore("https://keys.example");

		let first = backend.full_scan(&wallet).await.unwrap();
		assert_eq!(first.new_addresses, 3);

		keystore.add_address("k-3");
		let second = backend.quick_scan(&wallet).await.unwrap();
		assert_eq!(second.new_addresses, 1);
		assert_eq!(keystore.info_calls(), 4);

		let stored = store.get_addresses(&wallet.id).await.unwrap();
		let indices: Vec<Option<u64>> = stored.iter().map(|a| a.index).collect();
		assert_eq!(indices, vec![Some(0), Some(1), Some(2), Some(3)]);
		assert_eq!(connector.connected_urls()[0], "https://keys.example");
	}

	#[tokio::test]
	async fn keystore_balance_includes_limbo_delta() {
		let keystore = Arc::new(MockKeystore::with_addresses(&["k-0"]));
		keystore.set_balances(10_000, 7_500);
		let connector = Arc::new(MockConnector::new(Arc::clone(&keystore)));
		let persistence = Arc::new(StatePersistenceService::new(Arc::new(MemoryLedgerStore::new())));
		let backend = RemoteKeystoreBackend::new(connector, persistence, config());
		let wallet = Wallet::derived("walrus", SecretMaterial::new("seed"), "sc")
			.with_remote_keystore("https://keys.example");

		let delta = backend.sync_transactions_and_balance(&wallet).await.unwrap();
		assert_eq!(delta.confirmed_balance, 10_000);
		assert_eq!(delta.unconfirmed_delta, -2_500);
	}

	#[test]
	fn registry_rejects_unrecognized_combinations() {
		let chain = Arc::new(MockChain::new());
		let (derivation, persistence) =
			derivation_backend(chain, Arc::new(MemoryLedgerStore::new()), config());
		let keystore = RemoteKeystoreBackend::new(
			Arc::new(MockConnector::new(Arc::new(MockKeystore::with_addresses(&[])))),
			persistence,
			config(),
		);
		let registry = BackendRegistry::new(Arc::new(derivation), Arc::new(keystore));

		let seeded = Wallet::derived("w", SecretMaterial::new("seed"), "sc");
		assert_eq!(registry.select(&seeded).unwrap().name(), "derivation");

		let walrus = seeded.clone().with_remote_keystore("https://keys.example");
		assert_eq!(registry.select(&walrus).unwrap().name(), "remote-keystore");

		let mut no_server = walrus.clone();
		no_server.server_url = None;
		assert!(matches!(
			registry.select(&no_server),
			Err(WalletSyncError::UnknownWalletType { .. })
		));

		let mut unknown = seeded;
		unknown.backend = BackendType::Unknown;
		assert!(matches!(
			registry.select(&unknown),
			Err(WalletSyncError::UnknownWalletType { .. })
		));
	}
}
