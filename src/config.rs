/// Sync engine configuration from environment variables
///
/// Controls recovery lookahead, batch sizes, rescan cadence and remote deadlines.
/// Every knob has a default, so an empty environment yields a working engine.

use crate::crypto::KdfParams;
use crate::wallet::types::WalletSyncError;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Gap limit used by quick scans, and the distance they start behind the last used index
    pub quick_lookahead: u64,
    /// Gap limit used by full scans from index 0
    pub full_lookahead: u64,
    /// Hard ceiling on any requested lookahead
    pub max_lookahead: u64,
    /// Indices derived and checked per recovery batch
    pub batch_size: u64,
    /// Delay before a wallet is quick scanned again
    pub quick_rescan_interval: Duration,
    /// Delay before a wallet is fully scanned again
    pub full_rescan_interval: Duration,
    /// Deadline for chain-data and keystore calls
    pub remote_timeout: Duration,
    /// Deadline for derivation module calls
    pub derivation_timeout: Duration,
    /// Parallel address lookups against a keystore server
    pub keystore_concurrency: usize,
    /// Transactions kept in a wallet's history snapshot
    pub transaction_limit: usize,
    /// Argon2id cost for the key that seals secrets at rest
    pub kdf: KdfParams,
}

impl SyncConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables (all optional):
    /// - `SYNC_QUICK_LOOKAHEAD`, `SYNC_FULL_LOOKAHEAD`, `SYNC_MAX_LOOKAHEAD`
    /// - `SYNC_BATCH_SIZE`
    /// - `SYNC_QUICK_RESCAN_SECS`, `SYNC_FULL_RESCAN_SECS`
    /// - `SYNC_REMOTE_TIMEOUT_SECS`, `SYNC_DERIVATION_TIMEOUT_SECS`
    /// - `SYNC_KEYSTORE_CONCURRENCY`, `SYNC_TRANSACTION_LIMIT`
    /// - `SYNC_KDF_MEMORY_KIB`, `SYNC_KDF_ITERATIONS`, `SYNC_KDF_PARALLELISM`
    ///
    /// Unparseable values fall back to the default with a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            quick_lookahead: env_or("SYNC_QUICK_LOOKAHEAD", defaults.quick_lookahead),
            full_lookahead: env_or("SYNC_FULL_LOOKAHEAD", defaults.full_lookahead),
            max_lookahead: env_or("SYNC_MAX_LOOKAHEAD", defaults.max_lookahead),
            batch_size: env_or("SYNC_BATCH_SIZE", defaults.batch_size),
            quick_rescan_interval: Duration::from_secs(env_or(
                "SYNC_QUICK_RESCAN_SECS",
                defaults.quick_rescan_interval.as_secs(),
            )),
            full_rescan_interval: Duration::from_secs(env_or(
                "SYNC_FULL_RESCAN_SECS",
                defaults.full_rescan_interval.as_secs(),
            )),
            remote_timeout: Duration::from_secs(env_or(
                "SYNC_REMOTE_TIMEOUT_SECS",
                defaults.remote_timeout.as_secs(),
            )),
            derivation_timeout: Duration::from_secs(env_or(
                "SYNC_DERIVATION_TIMEOUT_SECS",
                defaults.derivation_timeout.as_secs(),
            )),
            keystore_concurrency: env_or("SYNC_KEYSTORE_CONCURRENCY", defaults.keystore_concurrency),
            transaction_limit: env_or("SYNC_TRANSACTION_LIMIT", defaults.transaction_limit),
            kdf: KdfParams {
                memory_kib: env_or("SYNC_KDF_MEMORY_KIB", defaults.kdf.memory_kib),
                iterations: env_or("SYNC_KDF_ITERATIONS", defaults.kdf.iterations),
                parallelism: env_or("SYNC_KDF_PARALLELISM", defaults.kdf.parallelism),
            },
        };

        info!(
            "Sync config: quick lookahead {}, full lookahead {}, batch {}, rescan {}s/{}s",
            config.quick_lookahead,
            config.full_lookahead,
            config.batch_size,
            config.quick_rescan_interval.as_secs(),
            config.full_rescan_interval.as_secs()
        );
        config
    }

    /// Reject a lookahead of zero or above the ceiling.
    pub fn check_lookahead(&self, lookahead: u64) -> Result<u64, WalletSyncError> {
        if lookahead == 0 || lookahead > self.max_lookahead {
            return Err(WalletSyncError::InvalidLookahead {
                requested: lookahead,
                ceiling: self.max_lookahead,
            });
        }
        Ok(lookahead)
    }

    /// Batch size actually used for a given lookahead.
    pub fn batch_for(&self, lookahead: u64) -> u64 {
        self.batch_size.clamp(1, lookahead.max(1))
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quick_lookahead: 25_000,
            full_lookahead: 25_000,
            max_lookahead: 25_000,
            batch_size: 1_000,
            quick_rescan_interval: Duration::from_secs(120),
            full_rescan_interval: Duration::from_secs(1_800),
            remote_timeout: Duration::from_secs(30),
            derivation_timeout: Duration::from_secs(15),
            keystore_concurrency: 8,
            transaction_limit: 100,
            kdf: KdfParams::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.quick_lookahead, 25_000);
        assert_eq!(config.full_lookahead, 25_000);
        assert_eq!(config.batch_size, 1_000);
        assert_eq!(config.quick_rescan_interval, Duration::from_secs(120));
        assert_eq!(config.kdf.memory_kib, 65_536);
    }

    #[test]
    fn test_lookahead_bounds() {
        let config = SyncConfig::default();
        assert!(config.check_lookahead(1).is_ok());
        assert!(config.check_lookahead(25_000).is_ok());
        assert!(matches!(
            config.check_lookahead(0),
            Err(WalletSyncError::InvalidLookahead { requested: 0, .. })
        ));
        assert!(matches!(
            config.check_lookahead(25_001),
            Err(WalletSyncError::InvalidLookahead { ceiling: 25_000, .. })
        ));
    }

    #[test]
    fn test_batch_never_exceeds_lookahead() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_for(25_000), 1_000);
        assert_eq!(config.batch_for(20), 20);

        let tiny = SyncConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert_eq!(tiny.batch_for(20), 1);
    }
}
