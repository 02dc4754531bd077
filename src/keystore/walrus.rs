//! HTTP client for a walrus-style keystore server.

use super::{KeystoreAddress, KeystoreApi, KeystoreConnector};
use crate::indexer::{ChainInput, ChainOutput, ChainTransaction, RemoteError};
use crate::wallet::types::{Currency, UnlockConditions, decimal_string};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct WalrusClient {
	http_client: Client,
	base_url: String,
}

impl WalrusClient {
	pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
		let http_client = Client::builder().timeout(timeout).build()?;
		Ok(Self {
			http_client,
			base_url: base_url.into().trim_end_matches('/').to_string(),
		})
	}

	async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
		let url = format!("{}{}", self.base_url, path);
		debug!("GET {}", url);

		let response = self.http_client.get(&url).send().await?;
		if !response.status().is_success() {
			let status = response.status();
			let message = response.text().await.unwrap_or_default();
			return Err(RemoteError::ApiError(format!("{}: {}", status, message.trim())));
		}
		Ok(response.json().await?)
	}
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUnlockConditions {
	#[serde(default)]
	public_keys: Vec<String>,
	#[serde(default)]
	signatures_required: u64,
	#[serde(default)]
	timelock: u64,
}

impl From<WireUnlockConditions> for UnlockConditions {
	fn from(wire: WireUnlockConditions) -> Self {
		Self {
			public_keys: wire.public_keys,
			signatures_required: wire.signatures_required,
			timelock: wire.timelock,
		}
	}
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAddressInfo {
	unlock_conditions: WireUnlockConditions,
	key_index: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOutput {
	#[serde(alias = "ID")]
	id: String,
	#[serde(with = "decimal_string")]
	value: Currency,
	#[serde(alias = "address")]
	unlock_hash: String,
}

impl From<WireOutput> for ChainOutput {
	fn from(wire: WireOutput) -> Self {
		Self {
			output_id: wire.id,
			unlock_hash: wire.unlock_hash,
			value: wire.value,
		}
	}
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInput {
	#[serde(default, alias = "parentID")]
	parent_id: String,
	#[serde(alias = "address")]
	unlock_hash: String,
	#[serde(with = "decimal_string")]
	value: Currency,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTransaction {
	#[serde(alias = "ID")]
	id: String,
	timestamp: DateTime<Utc>,
	#[serde(default)]
	block_height: u64,
	#[serde(default, with = "decimal_string")]
	fee: Currency,
	#[serde(default)]
	inputs: Vec<WireInput>,
	#[serde(default)]
	outputs: Vec<WireOutput>,
}

impl From<WireTransaction> for ChainTransaction {
	fn from(wire: WireTransaction) -> Self {
		Self {
			id: Some(wire.id),
			block_height: wire.block_height,
			confirmations: 0,
			timestamp: wire.timestamp,
			fees: wire.fee,
			siacoin_inputs: wire
				.inputs
				.into_iter()
				.map(|input| ChainInput {
					output_id: input.parent_id,
					unlock_hash: input.unlock_hash,
					value: input.value,
				})
				.collect(),
			siacoin_outputs: wire.outputs.into_iter().map(ChainOutput::from).collect(),
			tags: Vec::new(),
		}
	}
}

#[derive(Deserialize)]
struct WireBalance(#[serde(with = "decimal_string")] Currency);

#[async_trait]
impl KeystoreApi for WalrusClient {
	async fn addresses(&self) -> Result<Vec<String>, RemoteError> {
		self.get("/addresses").await
	}

	async fn address_info(&self, address: &str) -> Result<KeystoreAddress, RemoteError> {
		let info: WireAddressInfo = self.get(&format!("/addresses/{}", address)).await?;
		Ok(KeystoreAddress {
			address: address.to_string(),
			key_index: info.key_index,
			unlock_conditions: info.unlock_conditions.into(),
		})
	}

	async fn balance(&self, include_limbo: bool) -> Result<Currency, RemoteError> {
		let balance: WireBalance = self
			.get(&format!("/balance?limbo={}", include_limbo))
			.await?;
		Ok(balance.0)
	}

	async fn unspent_outputs(&self) -> Result<Vec<ChainOutput>, RemoteError> {
		let outputs: Vec<WireOutput> = self.get("/utxos").await?;
		Ok(outputs.into_iter().map(ChainOutput::from).collect())
	}

	async fn transactions(&self, limit: usize) -> Result<Vec<ChainTransaction>, RemoteError> {
		let transactions: Vec<WireTransaction> =
			self.get(&format!("/transactions?max={}", limit)).await?;
		Ok(transactions.into_iter().map(ChainTransaction::from).collect())
	}

	async fn limbo_transactions(&self) -> Result<Vec<ChainTransaction>, RemoteError> {
		let transactions: Vec<WireTransaction> = self.get("/limbo").await?;
		Ok(transactions.into_iter().map(ChainTransaction::from).collect())
	}
}

/// Builds a `WalrusClient` per server address with a shared timeout.
#[derive(Debug, Clone)]
pub struct WalrusConnector {
	timeout: Duration,
}

impl WalrusConnector {
	pub fn new(timeout: Duration) -> Self {
		Self { timeout }
	}
}

impl KeystoreConnector for WalrusConnector {
	fn connect(&self, server_url: &str) -> Result<Arc<dyn KeystoreApi>, RemoteError> {
		Ok(Arc::new(WalrusClient::new(server_url, self.timeout)?))
	}
}
