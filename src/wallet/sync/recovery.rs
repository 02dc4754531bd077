//! Gap-limit address recovery.
//!
//! Addresses are derived in index order in batches and checked against the chain
//! data source. The run stops once `lookahead` consecutive indices past the highest
//! used one have been classified as unused. Progress is handed to a
//! `RecoveryProgressHandler` after every batch, so a run interrupted by a remote
//! failure keeps everything it discovered before the failing batch.

use crate::config::SyncConfig;
use crate::derivation::{self, DerivationModule};
use crate::indexer::{self, ChainDataSource};
use crate::wallet::sync::progress_tracker::{RecoveryStats, RecoveryTracker};
use crate::wallet::types::{SecretMaterial, UnlockConditions, UsageType, WalletSyncError};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// An address found during recovery. `usage` is `None` only for the
/// next-receive address appended after a trailing spend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredAddress {
	pub address: String,
	pub index: u64,
	pub unlock_conditions: Option<UnlockConditions>,
	pub usage: Option<UsageType>,
}

/// Incremental recovery result, delivered once per batch and once at the end.
#[derive(Debug, Clone)]
pub struct RecoveryProgress {
	/// Used addresses discovered in this batch. Indices already known are not repeated.
	pub addresses: Vec<RecoveredAddress>,
	/// Highest used index known so far, including the starting hint.
	pub highest_used_index: Option<u64>,
	/// Every index below this has been classified.
	pub scanned_through: u64,
	pub done: bool,
}

/// Receives progress as recovery advances. An error aborts the run.
#[async_trait]
pub trait RecoveryProgressHandler: Send {
	async fn on_progress(&mut self, progress: &RecoveryProgress) -> Result<(), WalletSyncError>;
}

/// Parameters of one recovery run
#[derive(Debug)]
pub struct RecoveryRequest<'a> {
	pub secret: &'a SecretMaterial,
	pub currency: &'a str,
	pub start_index: u64,
	pub lookahead: u64,
	/// Last used index from cached state. Pushes the termination frontier forward.
	pub last_known_used_index: Option<u64>,
	/// Indices the store already holds as used. They are not queried again.
	pub known_used: &'a BTreeSet<u64>,
}

pub struct GapLimitScanner<'a> {
	derivation: &'a dyn DerivationModule,
	chain: &'a dyn ChainDataSource,
	config: &'a SyncConfig,
}

impl<'a> GapLimitScanner<'a> {
	pub fn new(
		derivation: &'a dyn DerivationModule,
		chain: &'a dyn ChainDataSource,
		config: &'a SyncConfig,
	) -> Self {
		Self {
			derivation,
			chain,
			config,
		}
	}

	/// Run recovery to completion.
	///
	/// A failing batch yields `RecoveryFailed` naming its index range. Batches
	/// before it have already been delivered to `handler`.
	pub async fn recover(
		&self,
		request: RecoveryRequest<'_>,
		handler: &mut dyn RecoveryProgressHandler,
	) -> Result<RecoveryStats, WalletSyncError> {
		let lookahead = self.config.check_lookahead(request.lookahead)?;
		let batch = self.config.batch_for(lookahead);
		let mut tracker = RecoveryTracker::new(
			request.start_index,
			lookahead,
			request.last_known_used_index,
		);
		let mut highest_usage: Option<(u64, UsageType)> = None;

		info!(
			"Starting address recovery at {} with lookahead {} (batch {})",
			request.start_index, lookahead, batch
		);

		let mut cursor = request.start_index;
		while cursor < tracker.limit() {
			let end = cursor.saturating_add(batch).min(tracker.limit());
			let addresses = self
				.scan_batch(&request, cursor, end, &mut tracker, &mut highest_usage)
				.await
				.map_err(|e| WalletSyncError::RecoveryFailed {
					start: cursor,
					end,
					source: Box::new(e),
				})?;

			tracker.record_batch(end);
			tracker.log_progress(false);
			handler
				.on_progress(&RecoveryProgress {
					addresses,
					highest_used_index: tracker.frontier(),
					scanned_through: end,
					done: false,
				})
				.await?;
			cursor = end;
		}

		let tail = self
			.next_receive_address(&request, &tracker, highest_usage)
			.await?;

		tracker.log_progress(true);
		handler
			.on_progress(&RecoveryProgress {
				addresses: tail,
				highest_used_index: tracker.frontier(),
				scanned_through: tracker.scanned_through(),
				done: true,
			})
			.await?;

		let stats = tracker.get_stats();
		info!("{}", stats.summary());
		Ok(stats)
	}

	async fn scan_batch(
		&self,
		request: &RecoveryRequest<'_>,
		start: u64,
		end: u64,
		tracker: &mut RecoveryTracker,
		highest_usage: &mut Option<(u64, UsageType)>,
	) -> Result<Vec<RecoveredAddress>, WalletSyncError> {
		let derived = derivation::within(
			self.config.derivation_timeout,
			self.derivation
				.derive_addresses(request.secret, request.currency, start, end - start),
		)
		.await?;

		let query: Vec<String> = derived
			.iter()
			.filter(|d| !request.known_used.contains(&d.index))
			.map(|d| d.address.clone())
			.collect();

		// Addresses missing from the response are unused.
		let used: HashMap<String, UsageType> = if query.is_empty() {
			HashMap::new()
		} else {
			indexer::within(
				self.config.remote_timeout,
				self.chain.find_used_addresses(&query),
			)
			.await?
			.into_iter()
			.map(|usage| (usage.address, usage.usage_type))
			.collect()
		};
		debug!(
			"Batch {}..{}: {} derived, {} queried, {} used",
			start,
			end,
			derived.len(),
			query.len(),
			used.len()
		);

		let mut found = Vec::new();
		for address in derived {
			if address.index < start || address.index >= end {
				continue;
			}
			if request.known_used.contains(&address.index) {
				tracker.record_used(address.index, false);
				continue;
			}
			if let Some(usage) = used.get(&address.address) {
				tracker.record_used(address.index, true);
				if highest_usage.is_none_or(|(index, _)| address.index > index) {
					*highest_usage = Some((address.index, *usage));
				}
				found.push(RecoveredAddress {
					address: address.address,
					index: address.index,
					unlock_conditions: address.unlock_conditions,
					usage: Some(*usage),
				});
			}
		}
		Ok(found)
	}

	/// When the highest used address was last seen spending, the wallet needs a
	/// fresh receive address right after it.
	async fn next_receive_address(
		&self,
		request: &RecoveryRequest<'_>,
		tracker: &RecoveryTracker,
		highest_usage: Option<(u64, UsageType)>,
	) -> Result<Vec<RecoveredAddress>, WalletSyncError> {
		let index = match highest_usage {
			Some((index, UsageType::Sent)) if tracker.frontier() == Some(index) => index + 1,
			_ => return Ok(Vec::new()),
		};
		if request.known_used.contains(&index) {
			return Ok(Vec::new());
		}

		let derived = derivation::within(
			self.config.derivation_timeout,
			self.derivation
				.derive_addresses(request.secret, request.currency, index, 1),
		)
		.await
		.map_err(|e| WalletSyncError::RecoveryFailed {
			start: index,
			end: index + 1,
			source: Box::new(e.into()),
		})?;

		Ok(derived
			.into_iter()
			.filter(|d| d.index == index)
			.map(|d| RecoveredAddress {
				address: d.address,
				index: d.index,
				unlock_conditions: d.unlock_conditions,
				usage: None,
			})
			.collect())
	}
}
