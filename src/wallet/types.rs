use crate::crypto::{SealError, SealedSecret};
use crate::derivation::DerivationError;
use crate::indexer::RemoteError;
use crate::wallet::sync::repositories::StoreError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Base unit amount (hastings). Wide enough for any siacoin value.
pub type Currency = u128;

/// Currency symbol of the default chain; it never contributes to wallet ids.
pub const DEFAULT_CURRENCY: &str = "sc";

/// Serde helper storing integer amounts as base-10 strings.
///
/// JSON numbers cannot carry 128-bit values reliably, so balances are written as strings.
/// Plain numbers are still accepted on input.
pub mod decimal_string {
	use serde::de::Error;
	use serde::{Deserialize, Deserializer, Serializer};
	use std::fmt::Display;
	use std::str::FromStr;

	pub fn serialize<T: Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(value)
	}

	pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
	where
		T: FromStr,
		T::Err: Display,
		D: Deserializer<'de>,
	{
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Raw {
			Text(String),
			Number(serde_json::Number),
		}

		match Raw::deserialize(deserializer)? {
			Raw::Text(text) => text.parse().map_err(D::Error::custom),
			Raw::Number(number) => number.to_string().parse().map_err(D::Error::custom),
		}
	}
}

/// Opaque wallet identifier: hex encoded SHA-512 of the wallet's identifying material.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(String);

impl WalletId {
	/// Derive the id from secret material and an optional sub-currency tag.
	///
	/// The default currency is ignored so a seed recovered with or without an explicit
	/// `sc` tag maps to the same wallet.
	pub fn derive(material: &str, currency: Option<&str>) -> Self {
		let mut hasher = Sha512::new();
		hasher.update(material.as_bytes());
		if let Some(currency) = currency.filter(|c| !c.is_empty() && *c != DEFAULT_CURRENCY) {
			hasher.update(b"-");
			hasher.update(currency.as_bytes());
		}
		Self(hex::encode(hasher.finalize()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for WalletId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// Full ids are 128 hex chars; the prefix is enough for logs.
		let short: String = self.0.chars().take(12).collect();
		f.write_str(&short)
	}
}

/// Seed phrase or other secret handed to the derivation module. Never inspected here,
/// and never serialized: it reaches the store only as a `SealedSecret`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretMaterial(String);

impl SecretMaterial {
	pub fn new(secret: impl Into<String>) -> Self {
		Self(secret.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretMaterial {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretMaterial(<redacted>)")
	}
}

/// How a wallet holds its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
	/// Secret-backed, can derive and sign.
	#[serde(alias = "default")]
	Derived,
	/// Signing happens on an external device.
	#[serde(alias = "ledger")]
	Hardware,
	/// Manually imported addresses only.
	#[serde(alias = "watch")]
	WatchOnly,
	#[serde(other)]
	Unknown,
}

impl WalletKind {
	/// Only secret-backed wallets take part in address discovery.
	pub fn can_derive(&self) -> bool {
		matches!(self, WalletKind::Derived)
	}
}

/// Which backend services the wallet's discovery and balance sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
	#[serde(alias = "siacentral")]
	Derivation,
	#[serde(alias = "walrus")]
	RemoteKeystore,
	#[serde(other)]
	Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
	Quick,
	Full,
}

impl fmt::Display for ScanKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ScanKind::Quick => f.write_str("quick"),
			ScanKind::Full => f.write_str("full"),
		}
	}
}

/// A named, keyed account together with its cached sync snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
	pub id: WalletId,
	pub name: String,
	pub kind: WalletKind,
	pub backend: BackendType,
	#[serde(default)]
	pub server_url: Option<String>,
	#[serde(default = "default_currency")]
	pub currency: String,
	/// Plaintext secret, present only while the wallet is unlocked.
	#[serde(skip)]
	pub secret: Option<SecretMaterial>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sealed_secret: Option<SealedSecret>,
	/// Scan currently running for this wallet. Only meaningful while the scheduler holds it.
	#[serde(skip)]
	pub scanning: Option<ScanKind>,
	#[serde(default)]
	pub last_used_index: Option<u64>,
	#[serde(default, with = "decimal_string")]
	pub confirmed_balance: Currency,
	#[serde(default, with = "decimal_string")]
	pub unconfirmed_delta: i128,
	#[serde(default)]
	pub transactions: Vec<ProcessedTransaction>,
	#[serde(default)]
	pub unspent_outputs: Vec<UnspentOutput>,
	#[serde(default)]
	pub unconfirmed_spent: Vec<String>,
	#[serde(default)]
	pub last_full_scan_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub last_synced_at: Option<DateTime<Utc>>,
}

fn default_currency() -> String {
	DEFAULT_CURRENCY.to_string()
}

impl Wallet {
	fn empty(id: WalletId, name: String, kind: WalletKind, currency: String) -> Self {
		Self {
			id,
			name,
			kind,
			backend: BackendType::Derivation,
			server_url: None,
			currency,
			secret: None,
			sealed_secret: None,
			scanning: None,
			last_used_index: None,
			confirmed_balance: 0,
			unconfirmed_delta: 0,
			transactions: Vec::new(),
			unspent_outputs: Vec::new(),
			unconfirmed_spent: Vec::new(),
			last_full_scan_at: None,
			last_synced_at: None,
		}
	}

	/// A seed-backed wallet. The id is stable for the same seed and currency.
	pub fn derived(name: impl Into<String>, secret: SecretMaterial, currency: &str) -> Self {
		let id = WalletId::derive(secret.expose(), Some(currency));
		let mut wallet = Self::empty(id, name.into(), WalletKind::Derived, currency.to_string());
		wallet.secret = Some(secret);
		wallet
	}

	/// A hardware wallet identified by the device's public key material.
	pub fn hardware(name: impl Into<String>, device_key: &str, currency: &str) -> Self {
		let id = WalletId::derive(device_key, Some(currency));
		Self::empty(id, name.into(), WalletKind::Hardware, currency.to_string())
	}

	/// A watch-only wallet; `label` is whatever stable material the user imported it under.
	pub fn watch_only(name: impl Into<String>, label: &str) -> Self {
		let id = WalletId::derive(label, None);
		Self::empty(id, name.into(), WalletKind::WatchOnly, default_currency())
	}

	/// Route this wallet through a remote keystore server.
	pub fn with_remote_keystore(mut self, server_url: impl Into<String>) -> Self {
		self.backend = BackendType::RemoteKeystore;
		self.server_url = Some(server_url.into());
		self
	}

	pub fn unconfirmed_balance(&self) -> i128 {
		(self.confirmed_balance as i128).saturating_add(self.unconfirmed_delta)
	}

	/// Replace the cached balance snapshot with the one in `delta`.
	pub fn apply_delta(&mut self, delta: WalletDelta) {
		self.confirmed_balance = delta.confirmed_balance;
		self.unconfirmed_delta = delta.unconfirmed_delta;
		self.transactions = delta.transactions;
		self.unspent_outputs = delta.unspent_outputs;
		self.unconfirmed_spent = delta.unconfirmed_spent;
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockConditions {
	#[serde(default)]
	pub public_keys: Vec<String>,
	#[serde(default)]
	pub signatures_required: u64,
	#[serde(default)]
	pub timelock: u64,
}

/// How an address has been seen on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageType {
	Sent,
	Received,
}

/// One address belonging to exactly one wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
	pub wallet_id: WalletId,
	pub address: String,
	/// Derivation index; absent for imported addresses.
	#[serde(default)]
	pub index: Option<u64>,
	#[serde(default)]
	pub unlock_conditions: Option<UnlockConditions>,
	#[serde(default, rename = "usage_type")]
	pub usage: Option<UsageType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
	Received,
	Sent,
	/// Every output went back to the wallet; only fees left it.
	#[serde(rename = "self")]
	SelfSent,
}

/// A transaction as seen from one wallet: owned value in and out collapsed to a direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedTransaction {
	pub id: String,
	#[serde(default)]
	pub block_height: u64,
	#[serde(default)]
	pub confirmations: u64,
	pub timestamp: DateTime<Utc>,
	#[serde(default, with = "decimal_string")]
	pub fees: Currency,
	pub direction: Direction,
	#[serde(with = "decimal_string")]
	pub value: Currency,
	#[serde(default)]
	pub tags: Vec<String>,
	#[serde(default)]
	pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
	pub output_id: String,
	pub address: String,
	#[serde(with = "decimal_string")]
	pub value: Currency,
}

/// Balance and history snapshot produced by one balance sync, merged into the wallet on commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletDelta {
	pub confirmed_balance: Currency,
	pub unconfirmed_delta: i128,
	pub transactions: Vec<ProcessedTransaction>,
	pub unspent_outputs: Vec<UnspentOutput>,
	pub unconfirmed_spent: Vec<String>,
}

/// Error taxonomy for the sync engine
#[derive(Debug, thiserror::Error)]
pub enum WalletSyncError {
	#[error("Remote unavailable: {0}")]
	RemoteUnavailable(#[from] RemoteError),

	#[error("Derivation failed: {0}")]
	DerivationFailed(#[from] DerivationError),

	#[error("Recovery failed for indices {start}..{end}: {source}")]
	RecoveryFailed {
		start: u64,
		end: u64,
		#[source]
		source: Box<WalletSyncError>,
	},

	#[error("Unknown wallet type: kind {kind:?} with backend {backend:?}")]
	UnknownWalletType { kind: WalletKind, backend: BackendType },

	#[error("Store write failed: {0}")]
	StoreWriteFailed(#[from] StoreError),

	#[error("Invalid lookahead {requested}: must be between 1 and {ceiling}")]
	InvalidLookahead { requested: u64, ceiling: u64 },

	#[error("Wallet not found: {0}")]
	WalletNotFound(WalletId),

	#[error("Wallet {0} has no secret material loaded")]
	MissingSecret(WalletId),

	#[error("Secret sealing failed: {0}")]
	SecretSealing(#[from] SealError),

	#[error("Wallet store is locked")]
	Locked,
}

impl WalletSyncError {
	/// Connectivity-type failures. These flip the offline indicator instead of being surfaced.
	pub fn is_transient(&self) -> bool {
		match self {
			WalletSyncError::RemoteUnavailable(_) | WalletSyncError::DerivationFailed(_) => true,
			WalletSyncError::RecoveryFailed { source, .. } => source.is_transient(),
			_ => false,
		}
	}
}
