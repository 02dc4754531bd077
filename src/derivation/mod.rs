//! Key derivation boundary
//!
//! Seeds are opaque here. Address generation and signing are delegated to an
//! isolated derivation module reached over a request/response channel.

mod rpc;

pub use rpc::{DEFAULT_DERIVATION_URL, RpcDerivationModule};

use crate::wallet::types::{SecretMaterial, UnlockConditions};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// An address produced by the derivation module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedAddress {
	pub address: String,
	#[serde(rename = "keyIndex", alias = "index")]
	pub index: u64,
	#[serde(default, rename = "unlockConditions", alias = "unlock_conditions")]
	pub unlock_conditions: Option<UnlockConditions>,
}

/// Error types for derivation module calls
#[derive(Debug, thiserror::Error)]
pub enum DerivationError {
	#[error("Derivation module error: {0}")]
	Module(String),

	#[error("Derivation call timed out after {0:?}")]
	Timeout(Duration),

	#[error("Derivation transport error: {0}")]
	Transport(#[from] reqwest::Error),

	#[error("Derivation response parse error: {0}")]
	Parse(#[from] serde_json::Error),
}

/// Deterministic key material operations.
#[async_trait]
pub trait DerivationModule: Send + Sync {
	/// Produce a fresh seed of the requested kind (e.g. `"sia"`, `"walrus"`).
	async fn generate_seed(&self, seed_type: &str) -> Result<SecretMaterial, DerivationError>;

	/// Derive `count` addresses starting at `start`, in index order.
	async fn derive_addresses(
		&self,
		secret: &SecretMaterial,
		currency: &str,
		start: u64,
		count: u64,
	) -> Result<Vec<DerivedAddress>, DerivationError>;

	/// Sign `transaction` with the keys at `key_indices`.
	async fn sign_transaction(
		&self,
		secret: &SecretMaterial,
		currency: &str,
		transaction: &serde_json::Value,
		key_indices: &[u64],
	) -> Result<serde_json::Value, DerivationError>;
}

/// Bound a derivation call by `deadline`.
pub async fn within<T, F>(deadline: Duration, future: F) -> Result<T, DerivationError>
where
	F: Future<Output = Result<T, DerivationError>>,
{
	match tokio::time::timeout(deadline, future).await {
		Ok(result) => result,
		Err(_) => Err(DerivationError::Timeout(deadline)),
	}
}
