use crate::indexer::{AddressBalance, ChainOutput, ChainTransaction};
use crate::wallet::types::{
	Currency, Direction, ProcessedTransaction, UnspentOutput, WalletDelta,
};
use std::collections::HashSet;
use tracing::debug;

/// Tag added to transactions that only moved value between the wallet's own addresses.
pub const DEFRAG_TAG: &str = "defrag";

/// Keystore-side view of a wallet, collected before processing.
#[derive(Debug, Clone, Default)]
pub struct KeystoreSnapshot {
	pub confirmed_balance: Currency,
	/// Balance with limbo transactions applied.
	pub limbo_balance: Currency,
	pub unspent_outputs: Vec<ChainOutput>,
	pub transactions: Vec<ChainTransaction>,
	pub limbo: Vec<ChainTransaction>,
}

/// Owned value moving through one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Flow {
	owned_in: Currency,
	owned_out: Currency,
	all_inputs_owned: bool,
	all_outputs_owned: bool,
}

impl Flow {
	fn of(txn: &ChainTransaction, owned: &HashSet<String>) -> Self {
		let mut flow = Flow {
			owned_in: 0,
			owned_out: 0,
			all_inputs_owned: !txn.siacoin_inputs.is_empty(),
			all_outputs_owned: !txn.siacoin_outputs.is_empty(),
		};
		for input in &txn.siacoin_inputs {
			if owned.contains(&input.unlock_hash) {
				flow.owned_in = flow.owned_in.saturating_add(input.value);
			} else {
				flow.all_inputs_owned = false;
			}
		}
		for output in &txn.siacoin_outputs {
			if owned.contains(&output.unlock_hash) {
				flow.owned_out = flow.owned_out.saturating_add(output.value);
			} else {
				flow.all_outputs_owned = false;
			}
		}
		flow
	}

	fn is_defrag(&self) -> bool {
		self.all_inputs_owned && self.all_outputs_owned
	}

	/// Signed effect on the wallet balance.
	fn net(&self) -> i128 {
		(self.owned_out as i128).saturating_sub(self.owned_in as i128)
	}
}

/// Turns raw chain transactions into wallet-relative history and balance deltas.
#[derive(Clone)]
pub struct TransactionProcessor {
	limit: usize,
}

impl TransactionProcessor {
	pub fn new(limit: usize) -> Self {
		Self { limit }
	}

	/// Build a snapshot from the explorer's view of the wallet's address set.
	pub fn process_balance(&self, balance: AddressBalance, owned: &HashSet<String>) -> WalletDelta {
		let mut seen = HashSet::new();
		let mut unconfirmed_delta: i128 = 0;

		let mut unconfirmed_spent = balance.unconfirmed_spent;
		let mut pending = Vec::new();
		for txn in &balance.unconfirmed_transactions {
			let flow = Flow::of(txn, owned);
			if let Some(processed) = self.classify(txn, flow, true, false, &mut seen) {
				unconfirmed_delta = unconfirmed_delta.saturating_add(flow.net());
				pending.push(processed);
			}
			collect_spent(txn, owned, &mut unconfirmed_spent);
		}

		let mut confirmed = Vec::new();
		for txn in &balance.transactions {
			let flow = Flow::of(txn, owned);
			if let Some(processed) = self.classify(txn, flow, false, false, &mut seen) {
				confirmed.push(processed);
			}
		}

		WalletDelta {
			confirmed_balance: balance.unspent_siacoins,
			unconfirmed_delta,
			transactions: self.merge_history(pending, confirmed),
			unspent_outputs: unspent(balance.unspent_siacoin_outputs),
			unconfirmed_spent,
		}
	}

	/// Build a snapshot from a keystore server's balance, history and limbo set.
	pub fn process_keystore(&self, snapshot: KeystoreSnapshot, owned: &HashSet<String>) -> WalletDelta {
		let mut seen = HashSet::new();

		let mut unconfirmed_spent = Vec::new();
		let mut pending = Vec::new();
		for txn in &snapshot.limbo {
			collect_spent(txn, owned, &mut unconfirmed_spent);
			let flow = Flow::of(txn, owned);
			if let Some(processed) = self.classify(txn, flow, true, true, &mut seen) {
				pending.push(processed);
			}
		}

		let mut confirmed = Vec::new();
		for txn in &snapshot.transactions {
			let flow = Flow::of(txn, owned);
			if let Some(processed) = self.classify(txn, flow, false, false, &mut seen) {
				confirmed.push(processed);
			}
		}

		WalletDelta {
			confirmed_balance: snapshot.confirmed_balance,
			unconfirmed_delta: (snapshot.limbo_balance as i128)
				.saturating_sub(snapshot.confirmed_balance as i128),
			transactions: self.merge_history(pending, confirmed),
			unspent_outputs: unspent(snapshot.unspent_outputs),
			unconfirmed_spent,
		}
	}

	/// `limbo` enables the self-send reading: a pending spend whose outputs all
	/// come back to the wallet only cost fees.
	fn classify(
		&self,
		txn: &ChainTransaction,
		flow: Flow,
		pending: bool,
		limbo: bool,
		seen: &mut HashSet<String>,
	) -> Option<ProcessedTransaction> {
		let id = transaction_id(txn)?;
		if !seen.insert(id.clone()) {
			return None;
		}

		let mut tags = txn.tags.clone();
		if flow.is_defrag() {
			tags.push(DEFRAG_TAG.to_string());
		}
		let (direction, value) = if limbo && flow.all_outputs_owned && flow.owned_in > 0 {
			(Direction::SelfSent, flow.owned_in.saturating_sub(flow.owned_out))
		} else if flow.owned_out > flow.owned_in {
			(Direction::Received, flow.owned_out - flow.owned_in)
		} else {
			(Direction::Sent, flow.owned_in - flow.owned_out)
		};

		if value == 0 {
			debug!("Skipping zero-value transaction {}", id);
			return None;
		}

		Some(ProcessedTransaction {
			id,
			block_height: txn.block_height,
			confirmations: txn.confirmations,
			timestamp: txn.timestamp,
			fees: txn.fees,
			direction,
			value,
			tags,
			pending,
		})
	}

	/// Pending first, each group newest first, capped at the history limit.
	fn merge_history(
		&self,
		mut pending: Vec<ProcessedTransaction>,
		mut confirmed: Vec<ProcessedTransaction>,
	) -> Vec<ProcessedTransaction> {
		pending.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
		confirmed.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
		pending.extend(confirmed);
		pending.truncate(self.limit);
		pending
	}
}

/// Synthetic transactions (miner payouts and the like) carry no id and are
/// named after their first output. Without outputs there is nothing to show.
fn transaction_id(txn: &ChainTransaction) -> Option<String> {
	match &txn.id {
		Some(id) if !id.is_empty() => Some(id.clone()),
		_ => txn
			.siacoin_outputs
			.first()
			.map(|output| format!("nontxn-{}", output.output_id)),
	}
}

/// Add the ids of outputs a pending transaction spends from the wallet.
fn collect_spent(txn: &ChainTransaction, owned: &HashSet<String>, spent: &mut Vec<String>) {
	for input in &txn.siacoin_inputs {
		if owned.contains(&input.unlock_hash) && !spent.contains(&input.output_id) {
			spent.push(input.output_id.clone());
		}
	}
}

fn unspent(outputs: Vec<ChainOutput>) -> Vec<UnspentOutput> {
	outputs
		.into_iter()
		.map(|output| UnspentOutput {
			output_id: output.output_id,
			address: output.unlock_hash,
			value: output.value,
		})
		.collect()
}
