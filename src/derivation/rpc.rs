use super::{DerivationError, DerivationModule, DerivedAddress};
use crate::wallet::types::SecretMaterial;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_DERIVATION_URL: &str = "http://127.0.0.1:9880/rpc";

/// Derivation module reached over a JSON request/response channel.
///
/// Requests are `{"method": .., "params": [..]}` and replies are
/// `{"error": null | "..", "result": ..}`. The module may run out of process,
/// so every call carries a deadline.
#[derive(Clone)]
pub struct RpcDerivationModule {
	http_client: Client,
	endpoint: String,
	deadline: Duration,
}

#[derive(Deserialize)]
struct RpcReply {
	#[serde(default)]
	error: Option<String>,
	#[serde(default)]
	result: serde_json::Value,
}

impl RpcDerivationModule {
	pub fn new(endpoint: impl Into<String>, deadline: Duration) -> Result<Self, DerivationError> {
		let http_client = Client::builder().timeout(deadline).build()?;
		Ok(Self {
			http_client,
			endpoint: endpoint.into(),
			deadline,
		})
	}

	async fn call<T: DeserializeOwned>(
		&self,
		method: &str,
		params: serde_json::Value,
	) -> Result<T, DerivationError> {
		debug!("derivation call {}", method);
		let request = async {
			let reply: RpcReply = self
				.http_client
				.post(&self.endpoint)
				.json(&json!({ "method": method, "params": params }))
				.send()
				.await?
				.json()
				.await?;
			Ok::<_, DerivationError>(reply)
		};

		let reply = super::within(self.deadline, request).await?;
		decode_reply(reply)
	}
}

/// A non-empty `error` wins over any result the module also sent.
fn decode_reply<T: DeserializeOwned>(reply: RpcReply) -> Result<T, DerivationError> {
	if let Some(error) = reply.error.filter(|e| !e.is_empty()) {
		return Err(DerivationError::Module(error));
	}
	Ok(serde_json::from_value(reply.result)?)
}

#[async_trait]
impl DerivationModule for RpcDerivationModule {
	async fn generate_seed(&self, seed_type: &str) -> Result<SecretMaterial, DerivationError> {
		let phrase: String = self.call("generateSeed", json!([seed_type])).await?;
		Ok(SecretMaterial::new(phrase))
	}

	async fn derive_addresses(
		&self,
		secret: &SecretMaterial,
		currency: &str,
		start: u64,
		count: u64,
	) -> Result<Vec<DerivedAddress>, DerivationError> {
		self.call(
			"generateAddresses",
			json!([secret.expose(), currency, start, count]),
		)
		.await
	}

	async fn sign_transaction(
		&self,
		secret: &SecretMaterial,
		currency: &str,
		transaction: &serde_json::Value,
		key_indices: &[u64],
	) -> Result<serde_json::Value, DerivationError> {
		self.call(
			"signTransaction",
			json!([secret.expose(), currency, transaction, key_indices]),
		)
		.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn reply(raw: serde_json::Value) -> RpcReply {
		serde_json::from_value(raw).unwrap()
	}

	#[test]
	fn module_error_is_surfaced() {
		let result: Result<Vec<DerivedAddress>, _> =
			decode_reply(reply(json!({ "error": "invalid seed phrase", "result": null })));
		assert!(matches!(result, Err(DerivationError::Module(msg)) if msg == "invalid seed phrase"));
	}

	#[test]
	fn derived_addresses_decode() {
		let addresses: Vec<DerivedAddress> = decode_reply(reply(json!({
			"error": "",
			"result": [
				{ "address": "addr-7", "keyIndex": 7, "unlockConditions": null },
			],
		})))
		.unwrap();
		assert_eq!(addresses.len(), 1);
		assert_eq!(addresses[0].address, "addr-7");
		assert_eq!(addresses[0].index, 7);

		let seed: String = decode_reply(reply(json!({ "result": "abandon ability able" }))).unwrap();
		assert_eq!(seed, "abandon ability able");
	}

	#[test]
	fn wrong_result_shape_is_a_parse_error() {
		let result: Result<Vec<DerivedAddress>, _> = decode_reply(reply(json!({ "result": { "oops": 1 } })));
		assert!(matches!(result, Err(DerivationError::Parse(_))));
	}
}
