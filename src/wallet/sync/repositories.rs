use crate::wallet::types::{AddressRecord, UsageType, Wallet, WalletId};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Error types for local ledger store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("I/O error on {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("Store unavailable: {0}")]
	Unavailable(String),
}

/// Durable per-wallet storage of wallet records and their address sets.
///
/// Address records are keyed by (wallet id, address). Writing a record that
/// already exists replaces it, and nothing but `delete_wallet` removes one.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
	async fn put_wallet(&self, wallet: &Wallet) -> Result<(), StoreError>;

	async fn get_wallet(&self, id: &WalletId) -> Result<Option<Wallet>, StoreError>;

	async fn list_wallets(&self) -> Result<Vec<Wallet>, StoreError>;

	async fn put_addresses(&self, addresses: &[AddressRecord]) -> Result<(), StoreError>;

	/// Addresses of one wallet ordered by derivation index. Imported addresses
	/// without an index come last, ordered by address.
	async fn get_addresses(&self, wallet_id: &WalletId) -> Result<Vec<AddressRecord>, StoreError>;

	/// Remove the wallet and every address record it owns.
	async fn delete_wallet(&self, id: &WalletId) -> Result<(), StoreError>;

	async fn count_wallets(&self) -> Result<usize, StoreError>;

	/// First address never seen spending, falling back to the last address.
	async fn change_address(&self, wallet_id: &WalletId) -> Result<Option<AddressRecord>, StoreError> {
		let addresses = self.get_addresses(wallet_id).await?;
		let unspent = addresses
			.iter()
			.find(|a| a.usage != Some(UsageType::Sent))
			.cloned();
		Ok(unspent.or_else(|| addresses.last().cloned()))
	}

	/// Most recently derived addresses, highest index first.
	async fn last_addresses(
		&self,
		wallet_id: &WalletId,
		limit: usize,
		offset: usize,
	) -> Result<Vec<AddressRecord>, StoreError> {
		let mut addresses: Vec<AddressRecord> = self
			.get_addresses(wallet_id)
			.await?
			.into_iter()
			.filter(|a| a.index.is_some())
			.collect();
		addresses.reverse();
		Ok(addresses.into_iter().skip(offset).take(limit).collect())
	}
}

fn sort_addresses(addresses: &mut [AddressRecord]) {
	addresses.sort_by(|a, b| match (a.index, b.index) {
		(Some(x), Some(y)) => x.cmp(&y).then_with(|| a.address.cmp(&b.address)),
		(Some(_), None) => std::cmp::Ordering::Less,
		(None, Some(_)) => std::cmp::Ordering::Greater,
		(None, None) => a.address.cmp(&b.address),
	});
}

#[derive(Default)]
struct MemoryState {
	wallets: HashMap<WalletId, Wallet>,
	addresses: HashMap<WalletId, BTreeMap<String, AddressRecord>>,
}

/// In-memory store. Useful for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryLedgerStore {
	state: RwLock<MemoryState>,
}

impl MemoryLedgerStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl LedgerStore for MemoryLedgerStore {
	async fn put_wallet(&self, wallet: &Wallet) -> Result<(), StoreError> {
		self.state
			.write()
			.await
			.wallets
			.insert(wallet.id.clone(), wallet.clone());
		Ok(())
	}

	async fn get_wallet(&self, id: &WalletId) -> Result<Option<Wallet>, StoreError> {
		Ok(self.state.read().await.wallets.get(id).cloned())
	}

	async fn list_wallets(&self) -> Result<Vec<Wallet>, StoreError> {
		let mut wallets: Vec<Wallet> = self.state.read().await.wallets.values().cloned().collect();
		wallets.sort_by(|a, b| a.id.cmp(&b.id));
		Ok(wallets)
	}

	async fn put_addresses(&self, addresses: &[AddressRecord]) -> Result<(), StoreError> {
		let mut state = self.state.write().await;
		for record in addresses {
			state
				.addresses
				.entry(record.wallet_id.clone())
				.or_default()
				.insert(record.address.clone(), record.clone());
		}
		Ok(())
	}

	async fn get_addresses(&self, wallet_id: &WalletId) -> Result<Vec<AddressRecord>, StoreError> {
		let mut addresses: Vec<AddressRecord> = self
			.state
			.read()
			.await
			.addresses
			.get(wallet_id)
			.map(|set| set.values().cloned().collect())
			.unwrap_or_default();
		sort_addresses(&mut addresses);
		Ok(addresses)
	}

	async fn delete_wallet(&self, id: &WalletId) -> Result<(), StoreError> {
		let mut state = self.state.write().await;
		state.wallets.remove(id);
		state.addresses.remove(id);
		Ok(())
	}

	async fn count_wallets(&self) -> Result<usize, StoreError> {
		Ok(self.state.read().await.wallets.len())
	}
}

/// File-based store: one JSON document per wallet and one per wallet's address set.
///
/// Layout under the data directory:
/// - `wallets/<id>.json`
/// - `addresses/<id>.json`
///
/// Writes go to a temporary file that is renamed into place.
pub struct FileLedgerStore {
	data_dir: PathBuf,
	// Serializes read-modify-write of address files.
	write_lock: Mutex<()>,
}

impl FileLedgerStore {
	/// Open (creating if needed) a store rooted at `data_dir`.
	pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
		let data_dir = data_dir.into();
		for sub in ["wallets", "addresses"] {
			let dir = data_dir.join(sub);
			tokio::fs::create_dir_all(&dir)
				.await
				.map_err(|e| io_error(&dir, e))?;
		}
		info!("Opened ledger store at {:?}", data_dir);
		Ok(Self {
			data_dir,
			write_lock: Mutex::new(()),
		})
	}

	fn wallet_path(&self, id: &WalletId) -> PathBuf {
		self.data_dir.join("wallets").join(format!("{}.json", id.as_str()))
	}

	fn addresses_path(&self, id: &WalletId) -> PathBuf {
		self.data_dir
			.join("addresses")
			.join(format!("{}.json", id.as_str()))
	}

	async fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
		let contents = serde_json::to_vec_pretty(value)?;
		let tmp = path.with_extension("json.tmp");
		tokio::fs::write(&tmp, &contents)
			.await
			.map_err(|e| io_error(&tmp, e))?;
		tokio::fs::rename(&tmp, path)
			.await
			.map_err(|e| io_error(path, e))?;
		Ok(())
	}

	async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
		match tokio::fs::read(path).await {
			Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(io_error(path, e)),
		}
	}

	async fn read_address_map(&self, id: &WalletId) -> Result<BTreeMap<String, AddressRecord>, StoreError> {
		Ok(self
			.read_json(&self.addresses_path(id))
			.await?
			.unwrap_or_default())
	}

	async fn remove_if_exists(&self, path: &Path) -> Result<(), StoreError> {
		match tokio::fs::remove_file(path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(io_error(path, e)),
		}
	}
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
	StoreError::Io {
		path: path.to_path_buf(),
		source,
	}
}

#[async_trait::async_trait]
impl LedgerStore for FileLedgerStore {
	async fn put_wallet(&self, wallet: &Wallet) -> Result<(), StoreError> {
		let path = self.wallet_path(&wallet.id);
		self.write_json(&path, wallet).await?;
		debug!("Saved wallet {} to {:?}", wallet.id, path);
		Ok(())
	}

	async fn get_wallet(&self, id: &WalletId) -> Result<Option<Wallet>, StoreError> {
		self.read_json(&self.wallet_path(id)).await
	}

	async fn list_wallets(&self) -> Result<Vec<Wallet>, StoreError> {
		let dir = self.data_dir.join("wallets");
		let mut entries = tokio::fs::read_dir(&dir)
			.await
			.map_err(|e| io_error(&dir, e))?;

		let mut wallets = Vec::new();
		while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
			let path = entry.path();
			if path.extension().and_then(|e| e.to_str()) != Some("json") {
				continue;
			}
			match self.read_json::<Wallet>(&path).await {
				Ok(Some(wallet)) => wallets.push(wallet),
				Ok(None) => {}
				Err(e) => warn!("Skipping unreadable wallet file {:?}: {}", path, e),
			}
		}
		wallets.sort_by(|a, b| a.id.cmp(&b.id));
		Ok(wallets)
	}

	async fn put_addresses(&self, addresses: &[AddressRecord]) -> Result<(), StoreError> {
		let _guard = self.write_lock.lock().await;

		let mut by_wallet: HashMap<&WalletId, Vec<&AddressRecord>> = HashMap::new();
		for record in addresses {
			by_wallet.entry(&record.wallet_id).or_default().push(record);
		}

		for (wallet_id, records) in by_wallet {
			let mut map = self.read_address_map(wallet_id).await?;
			for record in records {
				map.insert(record.address.clone(), record.clone());
			}
			self.write_json(&self.addresses_path(wallet_id), &map).await?;
			debug!("Saved {} addresses for wallet {}", map.len(), wallet_id);
		}
		Ok(())
	}

	async fn get_addresses(&self, wallet_id: &WalletId) -> Result<Vec<AddressRecord>, StoreError> {
		let mut addresses: Vec<AddressRecord> =
			self.read_address_map(wallet_id).await?.into_values().collect();
		sort_addresses(&mut addresses);
		Ok(addresses)
	}

	async fn delete_wallet(&self, id: &WalletId) -> Result<(), StoreError> {
		let _guard = self.write_lock.lock().await;
		self.remove_if_exists(&self.addresses_path(id)).await?;
		self.remove_if_exists(&self.wallet_path(id)).await?;
		info!("Deleted wallet {} and its addresses", id);
		Ok(())
	}

	async fn count_wallets(&self) -> Result<usize, StoreError> {
		Ok(self.list_wallets().await?.len())
	}
}
