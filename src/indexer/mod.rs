//! Chain-data explorer integration
//!
//! This module provides the `ChainDataSource` seam used by address recovery and
//! balance sync, together with its HTTP implementation and the shared wire types.

/// HTTP client for the explorer API
mod client;
/// Type definitions for explorer data structures
mod types;

pub use client::{ChainDataSource, DEFAULT_EXPLORER_URL, ExplorerClient, within};
pub use types::*;
