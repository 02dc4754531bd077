//! Sync engine for a non-custodial light wallet.
//!
//! Wallets are discovered with a gap-limit recovery protocol against a chain
//! data explorer, or read from a remote keystore server, and kept current by a
//! single-flight scan scheduler backed by a local ledger store.

pub mod config;
pub mod crypto;
pub mod derivation;
pub mod indexer;
pub mod keystore;
pub mod utils;
pub mod wallet;
