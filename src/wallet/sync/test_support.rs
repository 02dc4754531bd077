//! Scripted collaborators shared by the sync tests.

use crate::crypto::KdfParams;
use crate::derivation::{DerivationError, DerivationModule, DerivedAddress};
use crate::indexer::{AddressBalance, AddressUsage, ChainDataSource, ChainOutput, ChainTransaction, RemoteError};
use crate::keystore::{KeystoreAddress, KeystoreApi, KeystoreConnector};
use crate::wallet::sync::backends::{BackendSelector, ScanBackend, ScanReport};
use crate::wallet::sync::events::{SyncEvent, SyncEventHandler};
use crate::wallet::sync::recovery::{RecoveredAddress, RecoveryProgress, RecoveryProgressHandler};
use crate::wallet::sync::repositories::{LedgerStore, MemoryLedgerStore, StoreError};
use crate::wallet::types::{
	AddressRecord, BackendType, Currency, ScanKind, SecretMaterial, UnlockConditions, UsageType,
	Wallet, WalletDelta, WalletId, WalletSyncError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cheap Argon2 parameters so sealing stays fast in tests.
pub const FAST_KDF: KdfParams = KdfParams {
	memory_kib: 64,
	iterations: 1,
	parallelism: 1,
};

/// Derives `addr-<index>` for every index.
#[derive(Default)]
pub struct MockDerivation {
	max_derived: Mutex<Option<u64>>,
	fail_from: Mutex<Option<u64>>,
	delay: Mutex<Option<Duration>>,
}

impl MockDerivation {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn address(index: u64) -> String {
		format!("addr-{}", index)
	}

	pub fn index_of(address: &str) -> Option<u64> {
		address.strip_prefix("addr-")?.parse().ok()
	}

	pub fn max_derived_index(&self) -> Option<u64> {
		*self.max_derived.lock().unwrap()
	}

	/// Batches starting at or after `index` fail with a module error.
	pub fn fail_from(&self, index: Option<u64>) {
		*self.fail_from.lock().unwrap() = index;
	}

	pub fn set_delay(&self, delay: Option<Duration>) {
		*self.delay.lock().unwrap() = delay;
	}
}

#[async_trait]
impl DerivationModule for MockDerivation {
	async fn generate_seed(&self, _seed_type: &str) -> Result<SecretMaterial, DerivationError> {
		Ok(SecretMaterial::new("mock seed"))
	}

	async fn derive_addresses(
		&self,
		_secret: &SecretMaterial,
		_currency: &str,
		start: u64,
		count: u64,
	) -> Result<Vec<DerivedAddress>, DerivationError> {
		let delay = *self.delay.lock().unwrap();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
		if self.fail_from.lock().unwrap().is_some_and(|from| start >= from) {
			return Err(DerivationError::Module("key derivation unavailable".into()));
		}
		if count > 0 {
			let last = start + count - 1;
			let mut max = self.max_derived.lock().unwrap();
			*max = Some(max.map_or(last, |m| m.max(last)));
		}
		Ok((start..start + count)
			.map(|index| DerivedAddress {
				address: Self::address(index),
				index,
				unlock_conditions: Some(UnlockConditions {
					public_keys: vec![format!("ed25519:{:064x}", index)],
					signatures_required: 1,
					timelock: 0,
				}),
			})
			.collect())
	}

	async fn sign_transaction(
		&self,
		_secret: &SecretMaterial,
		_currency: &str,
		transaction: &serde_json::Value,
		_key_indices: &[u64],
	) -> Result<serde_json::Value, DerivationError> {
		Ok(transaction.clone())
	}
}

/// Chain data source with a scripted set of used addresses and a fixed balance.
#[derive(Default)]
pub struct MockChain {
	used: Mutex<HashMap<String, UsageType>>,
	queried: Mutex<Vec<String>>,
	used_lookups: AtomicUsize,
	fail_used_after: Mutex<Option<usize>>,
	balance: Mutex<AddressBalance>,
	balance_delay: Mutex<Option<Duration>>,
	lookup_delay: Mutex<Option<Duration>>,
	balance_calls: AtomicUsize,
	last_balance_query: Mutex<Vec<String>>,
}

impl MockChain {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_used(&self, index: u64, usage: UsageType) {
		self.used
			.lock()
			.unwrap()
			.insert(MockDerivation::address(index), usage);
	}

	/// Let `calls` used-address lookups succeed, then fail every later one.
	pub fn fail_used_lookups_after(&self, calls: usize) {
		*self.fail_used_after.lock().unwrap() = Some(calls);
	}

	pub fn set_balance(&self, balance: AddressBalance) {
		*self.balance.lock().unwrap() = balance;
	}

	pub fn set_balance_delay(&self, delay: Duration) {
		*self.balance_delay.lock().unwrap() = Some(delay);
	}

	pub fn set_lookup_delay(&self, delay: Duration) {
		*self.lookup_delay.lock().unwrap() = Some(delay);
	}

	pub fn clear_balance_delay(&self) {
		*self.balance_delay.lock().unwrap() = None;
	}

	pub fn used_lookups(&self) -> usize {
		self.used_lookups.load(Ordering::SeqCst)
	}

	pub fn balance_calls(&self) -> usize {
		self.balance_calls.load(Ordering::SeqCst)
	}

	pub fn last_balance_query(&self) -> Vec<String> {
		self.last_balance_query.lock().unwrap().clone()
	}

	pub fn was_queried(&self, address: &str) -> bool {
		self.queried.lock().unwrap().iter().any(|a| a == address)
	}

	pub fn max_queried_index(&self) -> Option<u64> {
		self.queried_indices().max()
	}

	pub fn min_queried_index(&self) -> Option<u64> {
		self.queried_indices().min()
	}

	fn queried_indices(&self) -> std::vec::IntoIter<u64> {
		self.queried
			.lock()
			.unwrap()
			.iter()
			.filter_map(|a| MockDerivation::index_of(a))
			.collect::<Vec<_>>()
			.into_iter()
	}
}

#[async_trait]
impl ChainDataSource for MockChain {
	async fn find_used_addresses(&self, addresses: &[String]) -> Result<Vec<AddressUsage>, RemoteError> {
		let delay = *self.lookup_delay.lock().unwrap();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
		let call = self.used_lookups.fetch_add(1, Ordering::SeqCst);
		if let Some(limit) = *self.fail_used_after.lock().unwrap() {
			if call >= limit {
				return Err(RemoteError::ApiError("explorer unavailable".into()));
			}
		}

		self.queried.lock().unwrap().extend(addresses.iter().cloned());
		let used = self.used.lock().unwrap();
		Ok(addresses
			.iter()
			.filter_map(|address| {
				used.get(address).map(|usage| AddressUsage {
					address: address.clone(),
					usage_type: *usage,
				})
			})
			.collect())
	}

	async fn address_balance(&self, addresses: &[String]) -> Result<AddressBalance, RemoteError> {
		self.balance_calls.fetch_add(1, Ordering::SeqCst);
		*self.last_balance_query.lock().unwrap() = addresses.to_vec();

		let delay = *self.balance_delay.lock().unwrap();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
		Ok(self.balance.lock().unwrap().clone())
	}
}

/// Collects every progress report of a recovery run.
#[derive(Default)]
pub struct RecordingHandler {
	pub progress: Vec<RecoveryProgress>,
}

impl RecordingHandler {
	pub fn all_addresses(&self) -> Vec<RecoveredAddress> {
		self.progress
			.iter()
			.flat_map(|p| p.addresses.iter().cloned())
			.filter(|a| a.usage.is_some())
			.collect()
	}
}

#[async_trait]
impl RecoveryProgressHandler for RecordingHandler {
	async fn on_progress(&mut self, progress: &RecoveryProgress) -> Result<(), WalletSyncError> {
		self.progress.push(progress.clone());
		Ok(())
	}
}

/// Keystore server holding a fixed address list; key index is the list position.
pub struct MockKeystore {
	addresses: Mutex<Vec<String>>,
	balances: Mutex<(Currency, Currency)>,
	info_calls: AtomicUsize,
}

impl MockKeystore {
	pub fn with_addresses(addresses: &[&str]) -> Self {
		Self {
			addresses: Mutex::new(addresses.iter().map(|a| a.to_string()).collect()),
			balances: Mutex::new((0, 0)),
			info_calls: AtomicUsize::new(0),
		}
	}

	pub fn add_address(&self, address: &str) {
		self.addresses.lock().unwrap().push(address.to_string());
	}

	pub fn set_balances(&self, confirmed: Currency, with_limbo: Currency) {
		*self.balances.lock().unwrap() = (confirmed, with_limbo);
	}

	pub fn info_calls(&self) -> usize {
		self.info_calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl KeystoreApi for MockKeystore {
	async fn addresses(&self) -> Result<Vec<String>, RemoteError> {
		Ok(self.addresses.lock().unwrap().clone())
	}

	async fn address_info(&self, address: &str) -> Result<KeystoreAddress, RemoteError> {
		self.info_calls.fetch_add(1, Ordering::SeqCst);
		let position = self
			.addresses
			.lock()
			.unwrap()
			.iter()
			.position(|a| a == address)
			.ok_or(RemoteError::NoData)?;
		Ok(KeystoreAddress {
			address: address.to_string(),
			key_index: position as u64,
			unlock_conditions: UnlockConditions {
				public_keys: vec![format!("ed25519:{}", address)],
				signatures_required: 1,
				timelock: 0,
			},
		})
	}

	async fn balance(&self, include_limbo: bool) -> Result<Currency, RemoteError> {
		let (confirmed, with_limbo) = *self.balances.lock().unwrap();
		Ok(if include_limbo { with_limbo } else { confirmed })
	}

	async fn unspent_outputs(&self) -> Result<Vec<ChainOutput>, RemoteError> {
		Ok(Vec::new())
	}

	async fn transactions(&self, _limit: usize) -> Result<Vec<ChainTransaction>, RemoteError> {
		Ok(Vec::new())
	}

	async fn limbo_transactions(&self) -> Result<Vec<ChainTransaction>, RemoteError> {
		Ok(Vec::new())
	}
}

pub struct MockConnector {
	keystore: Arc<MockKeystore>,
	urls: Mutex<Vec<String>>,
}

impl MockConnector {
	pub fn new(keystore: Arc<MockKeystore>) -> Self {
		Self {
			keystore,
			urls: Mutex::new(Vec::new()),
		}
	}

	pub fn connected_urls(&self) -> Vec<String> {
		self.urls.lock().unwrap().clone()
	}
}

impl KeystoreConnector for MockConnector {
	fn connect(&self, server_url: &str) -> Result<Arc<dyn KeystoreApi>, RemoteError> {
		self.urls.lock().unwrap().push(server_url.to_string());
		Ok(self.keystore.clone())
	}
}

/// Memory store whose writes can be switched to fail.
#[derive(Default)]
pub struct FailingStore {
	inner: MemoryLedgerStore,
	fail_wallets: AtomicBool,
	fail_addresses: AtomicBool,
}

impl FailingStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn fail_wallet_writes(&self, fail: bool) {
		self.fail_wallets.store(fail, Ordering::SeqCst);
	}

	pub fn fail_address_writes(&self, fail: bool) {
		self.fail_addresses.store(fail, Ordering::SeqCst);
	}
}

#[async_trait]
impl LedgerStore for FailingStore {
	async fn put_wallet(&self, wallet: &Wallet) -> Result<(), StoreError> {
		if self.fail_wallets.load(Ordering::SeqCst) {
			return Err(StoreError::Unavailable("disk full".into()));
		}
		self.inner.put_wallet(wallet).await
	}

	async fn get_wallet(&self, id: &WalletId) -> Result<Option<Wallet>, StoreError> {
		self.inner.get_wallet(id).await
	}

	async fn list_wallets(&self) -> Result<Vec<Wallet>, StoreError> {
		self.inner.list_wallets().await
	}

	async fn put_addresses(&self, addresses: &[AddressRecord]) -> Result<(), StoreError> {
		if self.fail_addresses.load(Ordering::SeqCst) {
			return Err(StoreError::Unavailable("disk full".into()));
		}
		self.inner.put_addresses(addresses).await
	}

	async fn get_addresses(&self, wallet_id: &WalletId) -> Result<Vec<AddressRecord>, StoreError> {
		self.inner.get_addresses(wallet_id).await
	}

	async fn delete_wallet(&self, id: &WalletId) -> Result<(), StoreError> {
		self.inner.delete_wallet(id).await
	}

	async fn count_wallets(&self) -> Result<usize, StoreError> {
		self.inner.count_wallets().await
	}
}

/// Backend that only records calls and how many ran at once.
pub struct InstrumentedBackend {
	delay: Duration,
	in_flight: AtomicUsize,
	max_in_flight: AtomicUsize,
	calls: Mutex<Vec<(WalletId, ScanKind)>>,
	fail_syncs: AtomicBool,
}

impl InstrumentedBackend {
	pub const BALANCE: Currency = 1_000;

	pub fn new(delay: Duration) -> Self {
		Self {
			delay,
			in_flight: AtomicUsize::new(0),
			max_in_flight: AtomicUsize::new(0),
			calls: Mutex::new(Vec::new()),
			fail_syncs: AtomicBool::new(false),
		}
	}

	pub fn fail_syncs(&self, fail: bool) {
		self.fail_syncs.store(fail, Ordering::SeqCst);
	}

	pub fn max_in_flight(&self) -> usize {
		self.max_in_flight.load(Ordering::SeqCst)
	}

	pub fn scans(&self, wallet_id: &WalletId, kind: ScanKind) -> usize {
		self.calls
			.lock()
			.unwrap()
			.iter()
			.filter(|(id, k)| id == wallet_id && *k == kind)
			.count()
	}

	async fn busy_for_a_while(&self) {
		let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
		self.max_in_flight.fetch_max(now, Ordering::SeqCst);
		tokio::time::sleep(self.delay).await;
		self.in_flight.fetch_sub(1, Ordering::SeqCst);
	}
}

#[async_trait]
impl ScanBackend for InstrumentedBackend {
	async fn quick_scan(&self, wallet: &Wallet) -> Result<ScanReport, WalletSyncError> {
		self.busy_for_a_while().await;
		self.calls.lock().unwrap().push((wallet.id.clone(), ScanKind::Quick));
		Ok(ScanReport::default())
	}

	async fn full_scan(&self, wallet: &Wallet) -> Result<ScanReport, WalletSyncError> {
		self.busy_for_a_while().await;
		self.calls.lock().unwrap().push((wallet.id.clone(), ScanKind::Full));
		Ok(ScanReport::default())
	}

	async fn sync_transactions_and_balance(&self, _wallet: &Wallet) -> Result<WalletDelta, WalletSyncError> {
		self.busy_for_a_while().await;
		if self.fail_syncs.load(Ordering::SeqCst) {
			return Err(WalletSyncError::RemoteUnavailable(RemoteError::NoData));
		}
		Ok(WalletDelta {
			confirmed_balance: Self::BALANCE,
			..Default::default()
		})
	}

	fn name(&self) -> &'static str {
		"instrumented"
	}
}

/// Routes every wallet to one backend, rejecting unknown backend types.
pub struct FixedSelector(pub Arc<dyn ScanBackend>);

impl BackendSelector for FixedSelector {
	fn select(&self, wallet: &Wallet) -> Result<Arc<dyn ScanBackend>, WalletSyncError> {
		if wallet.backend == BackendType::Unknown {
			return Err(WalletSyncError::UnknownWalletType {
				kind: wallet.kind,
				backend: wallet.backend,
			});
		}
		Ok(Arc::clone(&self.0))
	}
}

/// Event handler that keeps every event it sees.
#[derive(Default)]
pub struct RecordingEventHandler {
	events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl RecordingEventHandler {
	pub fn events(&self) -> Arc<Mutex<Vec<SyncEvent>>> {
		Arc::clone(&self.events)
	}
}

#[async_trait]
impl SyncEventHandler for RecordingEventHandler {
	async fn handle(&mut self, event: &SyncEvent) -> Result<(), WalletSyncError> {
		self.events.lock().unwrap().push(event.clone());
		Ok(())
	}

	fn name(&self) -> &'static str {
		"recorder"
	}
}
