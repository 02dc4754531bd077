//!
//! HTTP client for the chain-data explorer.
//!
//! The explorer answers two questions for an arbitrary address set: which of
//! these addresses have ever been used, and what is their combined balance and
//! history. Every call is bounded by the client timeout and by an explicit
//! deadline at the call site.

use super::types::*;
use crate::wallet::types::Currency;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Default public explorer endpoint.
pub const DEFAULT_EXPLORER_URL: &str = "https://api.siacentral.com/v2";

/// Source of on-chain facts about addresses.
#[async_trait]
pub trait ChainDataSource: Send + Sync {
	/// Return usage entries for the addresses that have been used. Unused
	/// addresses are simply absent from the result.
	async fn find_used_addresses(&self, addresses: &[String]) -> Result<Vec<AddressUsage>, RemoteError>;

	/// Combined balance, unspent outputs and history for the address set.
	async fn address_balance(&self, addresses: &[String]) -> Result<AddressBalance, RemoteError>;
}

/// Bound a remote future by `deadline`, mapping expiry to `RemoteError::Timeout`.
pub async fn within<T, F>(deadline: Duration, future: F) -> Result<T, RemoteError>
where
	F: Future<Output = Result<T, RemoteError>>,
{
	match tokio::time::timeout(deadline, future).await {
		Ok(result) => result,
		Err(_) => Err(RemoteError::Timeout(deadline)),
	}
}

/// Explorer HTTP client
#[derive(Clone)]
pub struct ExplorerClient {
	http_client: Client,
	base_url: String,
}

impl ExplorerClient {
	/// Create a new explorer client.
	///
	/// # Arguments
	/// * `base_url` - API root, e.g. `https://api.siacentral.com/v2`.
	/// * `timeout` - Per-request timeout applied by the HTTP client.
	pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
		let http_client = Client::builder().timeout(timeout).build()?;

		Ok(Self {
			http_client,
			base_url: base_url.into().trim_end_matches('/').to_string(),
		})
	}

	pub fn base_url(&self) -> &str {
		&self.base_url
	}

	/// POST a JSON body and decode the explorer's `{type, message, ...}` envelope.
	async fn post<T: DeserializeOwned>(
		&self,
		path: &str,
		body: serde_json::Value,
	) -> Result<T, RemoteError> {
		let url = format!("{}{}", self.base_url, path);
		debug!("POST {}", url);

		let response = self
			.http_client
			.post(&url)
			.header("Content-Type", "application/json")
			.json(&body)
			.send()
			.await?;

		let status = response.status();
		let response_json: serde_json::Value = response.json().await?;
		decode_envelope(status.is_success(), response_json)
	}
}

/// The explorer reports failures in-band with `type: "error"`, sometimes on a 200.
fn decode_envelope<T: DeserializeOwned>(
	http_ok: bool,
	body: serde_json::Value,
) -> Result<T, RemoteError> {
	let kind = body.get("type").and_then(|t| t.as_str()).unwrap_or("success");
	if !http_ok || kind != "success" {
		let message = body
			.get("message")
			.and_then(|m| m.as_str())
			.unwrap_or("unknown error");
		return Err(RemoteError::ApiError(message.to_string()));
	}
	if body.is_null() {
		return Err(RemoteError::NoData);
	}
	Ok(serde_json::from_value(body)?)
}

#[derive(serde::Deserialize)]
struct UsedAddressesResponse {
	#[serde(default)]
	addresses: Vec<AddressUsage>,
}

#[derive(serde::Deserialize)]
struct BalanceResponse {
	#[serde(default, with = "crate::wallet::types::decimal_string")]
	unspent_siacoins: Currency,
	#[serde(default)]
	unspent_siacoin_outputs: Vec<ChainOutput>,
	#[serde(default)]
	transactions: Vec<ChainTransaction>,
	#[serde(default)]
	unconfirmed_transactions: Vec<ChainTransaction>,
	#[serde(default)]
	unconfirmed_siacoins_spent: Vec<String>,
}

#[async_trait]
impl ChainDataSource for ExplorerClient {
	async fn find_used_addresses(&self, addresses: &[String]) -> Result<Vec<AddressUsage>, RemoteError> {
		if addresses.is_empty() {
			return Ok(Vec::new());
		}

		let response: UsedAddressesResponse = self
			.post("/wallet/addresses/used", json!({ "addresses": addresses }))
			.await?;
		debug!(
			"Explorer reported {} used of {} addresses",
			response.addresses.len(),
			addresses.len()
		);
		Ok(response.addresses)
	}

	async fn address_balance(&self, addresses: &[String]) -> Result<AddressBalance, RemoteError> {
		let response: BalanceResponse = self
			.post("/wallet/addresses", json!({ "addresses": addresses }))
			.await?;

		Ok(AddressBalance {
			unspent_siacoins: response.unspent_siacoins,
			unspent_siacoin_outputs: response.unspent_siacoin_outputs,
			transactions: response.transactions,
			unconfirmed_transactions: response.unconfirmed_transactions,
			unconfirmed_spent: response.unconfirmed_siacoins_spent,
		})
	}
}
