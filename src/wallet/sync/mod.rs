//! Wallet Synchronization Module
//!
//! This module keeps each wallet's address set, balance and history current. It is composed of several
//! submodules, each responsible for one aspect of the sync process:
//!
//! - `scheduler`: The entry point. Queues quick and full scans, runs them one at a time and rearms rescan timers.
//! - `backends`: Discovery and balance sync for derivation-backed and keystore-backed wallets.
//! - `recovery`: The gap-limit address recovery protocol.
//! - `progress_tracker`: Termination rule and statistics for a recovery run.
//! - `transaction_processor`: Turns chain transactions into wallet-relative history and balance deltas.
//! - `repositories`: The `LedgerStore` trait with in-memory and file-backed implementations.
//! - `state_persistence`: Service over the store used by backends and the scheduler.
//! - `events`: Scan lifecycle events and the handler dispatcher.

/// Discovery and balance sync backends
pub mod backends;
/// Event system for scan lifecycle notifications
pub mod events;
/// Tracks recovery progress and statistics
pub mod progress_tracker;
/// Gap-limit address recovery
pub mod recovery;
/// Local ledger store trait and implementations
pub mod repositories;
/// Single-flight scan queue and rescan timers
pub mod scheduler;
/// Persistence service over the ledger store
pub mod state_persistence;
/// Transaction classification and balance deltas
pub mod transaction_processor;

#[cfg(test)]
pub(crate) mod test_support;

pub use scheduler::{ScanRequest, ScanScheduler};
