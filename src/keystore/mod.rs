//! Remote keystore integration
//!
//! A remote keystore server owns the wallet's address list and can report
//! balances, unspent outputs and pending transactions for it. Each wallet names
//! its own server, so clients are created per wallet through a `KeystoreConnector`.

mod walrus;

pub use walrus::{WalrusClient, WalrusConnector};

use crate::indexer::{ChainOutput, ChainTransaction, RemoteError};
use crate::wallet::types::{Currency, UnlockConditions};
use async_trait::async_trait;
use std::sync::Arc;

/// One address known to the keystore server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystoreAddress {
	pub address: String,
	pub key_index: u64,
	pub unlock_conditions: UnlockConditions,
}

#[async_trait]
pub trait KeystoreApi: Send + Sync {
	/// Every address the server tracks for this wallet.
	async fn addresses(&self) -> Result<Vec<String>, RemoteError>;

	async fn address_info(&self, address: &str) -> Result<KeystoreAddress, RemoteError>;

	/// Confirmed balance, or the balance including limbo (pending) transactions.
	async fn balance(&self, include_limbo: bool) -> Result<Currency, RemoteError>;

	async fn unspent_outputs(&self) -> Result<Vec<ChainOutput>, RemoteError>;

	/// Most recent confirmed transactions, newest first, at most `limit`.
	async fn transactions(&self, limit: usize) -> Result<Vec<ChainTransaction>, RemoteError>;

	/// Transactions broadcast by this wallet and not yet confirmed.
	async fn limbo_transactions(&self) -> Result<Vec<ChainTransaction>, RemoteError>;
}

/// Creates a keystore client for a wallet's server address.
pub trait KeystoreConnector: Send + Sync {
	fn connect(&self, server_url: &str) -> Result<Arc<dyn KeystoreApi>, RemoteError>;
}
