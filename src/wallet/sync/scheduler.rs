//! Scan scheduler.
//!
//! Every scan of every wallet goes through one FIFO queue that holds at most one
//! entry per (wallet, kind). A single executor drains it, so no two scans ever
//! overlap: the `busy` flag is claimed with a compare-exchange before a drain
//! task is spawned and released only when the queue is observed empty.
//!
//! After each scan, successful or not, the wallet gets a rescan timer for the
//! same kind. Timers hold a weak reference back to the scheduler and are
//! aborted before being rearmed, when the wallet is removed, and on `lock`.
//! A timer is only armed while the registry read guard shows the wallet, so
//! it cannot slip in after `lock` or `remove_wallet` took the write guard.
//!
//! Removing a wallet whose scan is in flight deletes it at once and again
//! when the scan returns, so address batches flushed in between do not survive.

use crate::config::SyncConfig;
use crate::crypto::{SealError, SecretSealer};
use crate::utils::format_token_amount;
use crate::wallet::sync::backends::{BackendSelector, ScanReport};
use crate::wallet::sync::events::{EventDispatcher, SyncEvent, SyncEventHandler};
use crate::wallet::sync::state_persistence::StatePersistenceService;
use crate::wallet::types::{AddressRecord, ScanKind, Wallet, WalletId, WalletSyncError};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Siacoin amounts have 24 decimal places.
const COIN_DECIMALS: u32 = 24;

/// One queued unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
	pub wallet_id: WalletId,
	pub kind: ScanKind,
}

#[derive(Default)]
struct WalletTimers {
	quick: Option<JoinHandle<()>>,
	full: Option<JoinHandle<()>>,
}

impl WalletTimers {
	fn slot(&mut self, kind: ScanKind) -> &mut Option<JoinHandle<()>> {
		match kind {
			ScanKind::Quick => &mut self.quick,
			ScanKind::Full => &mut self.full,
		}
	}

	fn abort_all(&mut self) {
		for handle in [self.quick.take(), self.full.take()].into_iter().flatten() {
			handle.abort();
		}
	}
}

pub struct ScanScheduler {
	config: SyncConfig,
	persistence: Arc<StatePersistenceService>,
	backends: Arc<dyn BackendSelector>,
	wallets: RwLock<HashMap<WalletId, Wallet>>,
	queue: Mutex<VecDeque<ScanRequest>>,
	busy: AtomicBool,
	idle: Notify,
	timers: Mutex<HashMap<WalletId, WalletTimers>>,
	/// Wallets removed while their scan was running.
	pending_deletes: Mutex<HashSet<WalletId>>,
	offline: watch::Sender<bool>,
	dispatcher: AsyncMutex<EventDispatcher>,
}

impl ScanScheduler {
	pub fn new(
		config: SyncConfig,
		persistence: Arc<StatePersistenceService>,
		backends: Arc<dyn BackendSelector>,
	) -> Arc<Self> {
		let (offline, _) = watch::channel(false);
		Arc::new(Self {
			config,
			persistence,
			backends,
			wallets: RwLock::new(HashMap::new()),
			queue: Mutex::new(VecDeque::new()),
			busy: AtomicBool::new(false),
			idle: Notify::new(),
			timers: Mutex::new(HashMap::new()),
			pending_deletes: Mutex::new(HashSet::new()),
			offline,
			dispatcher: AsyncMutex::new(EventDispatcher::new()),
		})
	}

	pub async fn register_handler(&self, handler: Box<dyn SyncEventHandler>) {
		self.dispatcher.lock().await.register_handler(handler);
	}

	fn lock_queue(&self) -> MutexGuard<'_, VecDeque<ScanRequest>> {
		self.queue.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn lock_timers(&self) -> MutexGuard<'_, HashMap<WalletId, WalletTimers>> {
		self.timers.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn lock_pending_deletes(&self) -> MutexGuard<'_, HashSet<WalletId>> {
		self.pending_deletes.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Derive the sealing key from `password`, load and open every stored
	/// wallet, and schedule its first scans: a quick scan for all of them, then
	/// a full scan for those never fully scanned. A wrong password leaves the
	/// scheduler locked.
	pub async fn unlock(self: &Arc<Self>, password: &str) -> Result<usize, WalletSyncError> {
		let params = self.config.kdf;
		let password = Zeroizing::new(password.to_string());
		let sealer = tokio::task::spawn_blocking(move || SecretSealer::new(&password, params))
			.await
			.map_err(|e| SealError::KeyDerivation(e.to_string()))??;
		self.persistence.unlock(sealer);

		let wallets = match self.persistence.load_wallets().await {
			Ok(wallets) => wallets,
			Err(e) => {
				self.persistence.lock();
				return Err(e);
			}
		};
		let ids: Vec<WalletId> = wallets.iter().map(|w| w.id.clone()).collect();
		let never_full: Vec<WalletId> = wallets
			.iter()
			.filter(|w| w.last_full_scan_at.is_none())
			.map(|w| w.id.clone())
			.collect();

		{
			let mut registry = self.wallets.write().await;
			for mut wallet in wallets {
				wallet.scanning = None;
				registry.insert(wallet.id.clone(), wallet);
			}
		}

		for id in &ids {
			self.enqueue(id.clone(), ScanKind::Quick);
		}
		for id in never_full {
			self.enqueue(id, ScanKind::Full);
		}

		info!("Unlocked {} wallets", ids.len());
		Ok(ids.len())
	}

	/// Drop all queued work, timers, in-memory wallets and the sealing key.
	/// A scan already running finishes but commits nothing.
	pub async fn lock(&self) {
		let mut registry = self.wallets.write().await;
		self.lock_queue().clear();
		for (_, mut timers) in self.lock_timers().drain() {
			timers.abort_all();
		}
		registry.clear();
		self.persistence.lock();
		info!("Scheduler locked, wallet state released");
	}

	/// Persist and register a wallet, then queue a full scan for it. Adding a
	/// wallet that already exists keeps its synced state and updates its name
	/// and secret.
	pub async fn add_wallet(self: &Arc<Self>, wallet: Wallet) -> Result<WalletId, WalletSyncError> {
		if !self.persistence.is_unlocked() {
			return Err(WalletSyncError::Locked);
		}
		let id = wallet.id.clone();
		let registered = self.wallets.read().await.get(&id).cloned();
		let existing = match registered {
			Some(existing) => Some(existing),
			None => self.persistence.store().get_wallet(&id).await?,
		};

		let merged = match existing {
			Some(mut existing) => {
				existing.name = wallet.name;
				if wallet.secret.is_some() {
					existing.secret = wallet.secret;
				}
				existing
			}
			None => wallet,
		};

		self.persistence.save_wallet(&merged).await?;
		info!("Added wallet {} ({})", merged.id, merged.name);
		self.lock_pending_deletes().remove(&id);
		self.wallets.write().await.insert(id.clone(), merged);
		self.enqueue(id.clone(), ScanKind::Full);
		Ok(id)
	}

	/// Attach manually imported addresses to a wallet and queue a quick scan.
	pub async fn import_addresses(
		self: &Arc<Self>,
		wallet_id: &WalletId,
		addresses: &[String],
	) -> Result<usize, WalletSyncError> {
		if !self.wallets.read().await.contains_key(wallet_id) {
			return Err(WalletSyncError::WalletNotFound(wallet_id.clone()));
		}

		let records: Vec<AddressRecord> = addresses
			.iter()
			.map(|address| AddressRecord {
				wallet_id: wallet_id.clone(),
				address: address.clone(),
				index: None,
				unlock_conditions: None,
				usage: None,
			})
			.collect();
		self.persistence.save_addresses(&records).await?;
		self.enqueue(wallet_id.clone(), ScanKind::Quick);
		Ok(records.len())
	}

	/// Cancel the wallet's timers and queued scans, then delete it and its
	/// addresses. If its scan is running, the delete is repeated once the scan
	/// returns.
	pub async fn remove_wallet(&self, wallet_id: &WalletId) -> Result<(), WalletSyncError> {
		{
			let mut registry = self.wallets.write().await;
			if let Some(mut timers) = self.lock_timers().remove(wallet_id) {
				timers.abort_all();
			}
			self.lock_queue().retain(|r| &r.wallet_id != wallet_id);
			let removed = registry.remove(wallet_id);
			if removed.is_some_and(|w| w.scanning.is_some()) {
				debug!("Wallet {} is being scanned, deleting again afterwards", wallet_id);
				self.lock_pending_deletes().insert(wallet_id.clone());
			}
		}
		self.persistence.delete_wallet(wallet_id).await?;
		info!("Removed wallet {}", wallet_id);
		Ok(())
	}

	pub async fn rename_wallet(&self, wallet_id: &WalletId, name: impl Into<String>) -> Result<(), WalletSyncError> {
		let mut registry = self.wallets.write().await;
		let mut updated = registry
			.get(wallet_id)
			.cloned()
			.ok_or_else(|| WalletSyncError::WalletNotFound(wallet_id.clone()))?;
		updated.name = name.into();
		self.persistence.save_wallet(&updated).await?;
		registry.insert(wallet_id.clone(), updated);
		Ok(())
	}

	/// Snapshot of one wallet's current state.
	pub async fn wallet(&self, wallet_id: &WalletId) -> Option<Wallet> {
		self.wallets.read().await.get(wallet_id).cloned()
	}

	pub async fn wallets(&self) -> Vec<Wallet> {
		let mut wallets: Vec<Wallet> = self.wallets.read().await.values().cloned().collect();
		wallets.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
		wallets
	}

	pub fn is_offline(&self) -> bool {
		*self.offline.borrow()
	}

	/// Receiver that observes every change of the offline indicator.
	pub fn subscribe_offline(&self) -> watch::Receiver<bool> {
		self.offline.subscribe()
	}

	pub fn queued(&self) -> Vec<ScanRequest> {
		self.lock_queue().iter().cloned().collect()
	}

	/// Whether a rescan timer of `kind` is pending for the wallet.
	pub fn has_timer(&self, wallet_id: &WalletId, kind: ScanKind) -> bool {
		self.lock_timers()
			.get_mut(wallet_id)
			.and_then(|timers| timers.slot(kind).as_ref().map(|h| !h.is_finished()))
			.unwrap_or(false)
	}

	/// Queue a scan unless the same (wallet, kind) is already waiting.
	/// Returns whether a new entry was added.
	pub fn enqueue(self: &Arc<Self>, wallet_id: WalletId, kind: ScanKind) -> bool {
		let added = {
			let mut queue = self.lock_queue();
			if queue.iter().any(|r| r.wallet_id == wallet_id && r.kind == kind) {
				false
			} else {
				queue.push_back(ScanRequest {
					wallet_id: wallet_id.clone(),
					kind,
				});
				true
			}
		};

		if added {
			debug!("Queued {} scan for wallet {}", kind, wallet_id);
		} else {
			debug!("{} scan for wallet {} already queued", kind, wallet_id);
		}
		self.wake();
		added
	}

	fn wake(self: &Arc<Self>) {
		if self
			.busy
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
		{
			let scheduler = Arc::clone(self);
			tokio::spawn(async move { scheduler.drain().await });
		}
	}

	async fn drain(self: Arc<Self>) {
		loop {
			let next = self.lock_queue().pop_front();
			if let Some(request) = next {
				self.execute(request).await;
				continue;
			}

			self.busy.store(false, Ordering::Release);
			// An enqueue may have landed between the empty pop and the release.
			let pending = !self.lock_queue().is_empty();
			if !pending
				|| self
					.busy
					.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
					.is_err()
			{
				break;
			}
		}
		self.idle.notify_waiters();
	}

	/// Resolve once the queue is empty and no scan is running.
	pub async fn wait_idle(&self) {
		loop {
			let notified = self.idle.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			if !self.busy.load(Ordering::Acquire) && self.lock_queue().is_empty() {
				return;
			}
			notified.await;
		}
	}

	async fn execute(self: &Arc<Self>, request: ScanRequest) {
		let ScanRequest { wallet_id, kind } = request;
		self.cancel_timer(&wallet_id, kind);

		let wallet = {
			let mut registry = self.wallets.write().await;
			match registry.get_mut(&wallet_id) {
				Some(wallet) => {
					wallet.scanning = Some(kind);
					wallet.clone()
				}
				None => {
					debug!("Wallet {} no longer registered, dropping {} scan", wallet_id, kind);
					return;
				}
			}
		};

		info!("Starting {} scan of wallet {} ({})", kind, wallet.id, wallet.name);
		self.emit(SyncEvent::ScanStarted {
			wallet_id: wallet_id.clone(),
			kind,
		})
		.await;

		let outcome = self.run_scan(&wallet, kind).await;

		if let Some(current) = self.wallets.write().await.get_mut(&wallet_id) {
			current.scanning = None;
		}

		if self.lock_pending_deletes().remove(&wallet_id) {
			match self.persistence.delete_wallet(&wallet_id).await {
				Ok(()) => debug!("Deleted records flushed by the last scan of removed wallet {}", wallet_id),
				Err(e) => error!("Failed to delete removed wallet {}: {}", wallet_id, e),
			}
			return;
		}

		match outcome {
			Ok(Some((updated, report))) => {
				self.set_offline(false).await;
				info!(
					"Finished {} scan of wallet {}: balance {} SC, {} new addresses",
					kind,
					wallet_id,
					format_token_amount(updated.confirmed_balance, COIN_DECIMALS),
					report.new_addresses
				);
				self.emit(SyncEvent::ScanCompleted {
					wallet_id: wallet_id.clone(),
					kind,
					report,
					confirmed_balance: updated.confirmed_balance,
					unconfirmed_delta: updated.unconfirmed_delta,
				})
				.await;
			}
			Ok(None) => {
				debug!("Wallet {} went away during {} scan", wallet_id, kind);
			}
			Err(e) => {
				let transient = e.is_transient();
				if transient {
					warn!("{} scan of wallet {} failed: {}", kind, wallet_id, e);
					self.set_offline(true).await;
				} else {
					error!("{} scan of wallet {} failed: {}", kind, wallet_id, e);
				}
				self.emit(SyncEvent::ScanFailed {
					wallet_id: wallet_id.clone(),
					kind,
					error: e.to_string(),
					transient,
				})
				.await;
			}
		}

		self.arm_timer(&wallet_id, kind).await;
	}

	/// Discovery, then balance sync, then an atomic commit. Returns `None` when
	/// the wallet was removed or the scheduler locked while the scan ran.
	async fn run_scan(
		&self,
		wallet: &Wallet,
		kind: ScanKind,
	) -> Result<Option<(Wallet, ScanReport)>, WalletSyncError> {
		let backend = self.backends.select(wallet)?;
		debug!("Wallet {} uses the {} backend", wallet.id, backend.name());

		let report = if wallet.kind.can_derive() {
			match kind {
				ScanKind::Quick => backend.quick_scan(wallet).await?,
				ScanKind::Full => backend.full_scan(wallet).await?,
			}
		} else {
			ScanReport::default()
		};

		let delta = backend.sync_transactions_and_balance(wallet).await?;

		let mut registry = self.wallets.write().await;
		let Some(current) = registry.get(&wallet.id) else {
			return Ok(None);
		};
		let updated = self
			.persistence
			.commit_sync(current, kind, report.highest_used_index, delta)
			.await?;
		registry.insert(wallet.id.clone(), updated.clone());
		Ok(Some((updated, report)))
	}

	async fn set_offline(&self, offline: bool) {
		let changed = self.offline.send_if_modified(|current| {
			if *current == offline {
				false
			} else {
				*current = offline;
				true
			}
		});
		if changed {
			if offline {
				warn!("Remote services unreachable, marking offline");
			} else {
				info!("Remote services reachable again");
			}
			self.emit(SyncEvent::OfflineChanged { offline }).await;
		}
	}

	async fn emit(&self, event: SyncEvent) {
		self.dispatcher.lock().await.dispatch(&event).await;
	}

	fn cancel_timer(&self, wallet_id: &WalletId, kind: ScanKind) {
		if let Some(timers) = self.lock_timers().get_mut(wallet_id) {
			if let Some(handle) = timers.slot(kind).take() {
				handle.abort();
			}
		}
	}

	async fn arm_timer(self: &Arc<Self>, wallet_id: &WalletId, kind: ScanKind) {
		// Held until the handle is stored; `lock` and `remove_wallet` clear
		// timers under the write guard.
		let registry = self.wallets.read().await;
		if !registry.contains_key(wallet_id) {
			return;
		}

		let delay = match kind {
			ScanKind::Quick => self.config.quick_rescan_interval,
			ScanKind::Full => self.config.full_rescan_interval,
		};
		let scheduler = Arc::downgrade(self);
		let id = wallet_id.clone();
		let handle = tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			if let Some(scheduler) = scheduler.upgrade() {
				scheduler.enqueue(id, kind);
			}
		});

		let mut timers = self.lock_timers();
		if let Some(previous) = timers.entry(wallet_id.clone()).or_default().slot(kind).replace(handle) {
			previous.abort();
		}
		drop(timers);
		drop(registry);
	}
}
