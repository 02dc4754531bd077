//! Wire types for the chain-data explorer and the shared transaction shape

use crate::wallet::types::{Currency, UsageType, decimal_string};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Usage of one address as reported by the explorer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressUsage {
    pub address: String,
    /// How the address was first seen on-chain.
    pub usage_type: UsageType,
}

/// A siacoin input. `unlock_hash` is the address that owned the spent output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainInput {
    #[serde(default)]
    pub output_id: String,
    pub unlock_hash: String,
    #[serde(with = "decimal_string")]
    pub value: Currency,
}

/// A siacoin output paying `unlock_hash`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainOutput {
    pub output_id: String,
    pub unlock_hash: String,
    #[serde(with = "decimal_string")]
    pub value: Currency,
}

/// Transaction as delivered by either remote. Processing turns it into a
/// wallet-relative `ProcessedTransaction`.
///
/// Synthetic entries such as miner payouts arrive without an id; they are
/// identified by their first output instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainTransaction {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub block_height: u64,
    #[serde(default)]
    pub confirmations: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, with = "decimal_string")]
    pub fees: Currency,
    #[serde(default)]
    pub siacoin_inputs: Vec<ChainInput>,
    #[serde(default)]
    pub siacoin_outputs: Vec<ChainOutput>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Aggregated balance of an address set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressBalance {
    #[serde(default, with = "decimal_string")]
    pub unspent_siacoins: Currency,
    #[serde(default)]
    pub unspent_siacoin_outputs: Vec<ChainOutput>,
    #[serde(default)]
    pub transactions: Vec<ChainTransaction>,
    #[serde(default)]
    pub unconfirmed_transactions: Vec<ChainTransaction>,
    /// Output ids spent by transactions still in the pool.
    #[serde(default)]
    pub unconfirmed_spent: Vec<String>,
}

/// Error types for remote chain-data and keystore calls
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("No data returned")]
    NoData,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}
