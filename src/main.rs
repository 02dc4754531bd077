use lite_wallet_sync::config::SyncConfig;
use lite_wallet_sync::derivation::{DEFAULT_DERIVATION_URL, DerivationModule, RpcDerivationModule};
use lite_wallet_sync::indexer::{DEFAULT_EXPLORER_URL, ExplorerClient};
use lite_wallet_sync::keystore::WalrusConnector;
use lite_wallet_sync::utils::format_token_amount;
use lite_wallet_sync::wallet::sync::backends::{
	BackendRegistry, DerivationBackend, RemoteKeystoreBackend,
};
use lite_wallet_sync::wallet::sync::events::{SyncEvent, SyncEventHandler};
use lite_wallet_sync::wallet::sync::repositories::{FileLedgerStore, LedgerStore};
use lite_wallet_sync::wallet::sync::state_persistence::StatePersistenceService;
use lite_wallet_sync::wallet::{DEFAULT_CURRENCY, ScanScheduler, SecretMaterial, Wallet, WalletSyncError};

use std::sync::Arc;
use tracing::{error, info, warn};

/// Logs every scan lifecycle event.
struct LoggingEventHandler;

#[async_trait::async_trait]
impl SyncEventHandler for LoggingEventHandler {
	async fn handle(&mut self, event: &SyncEvent) -> Result<(), WalletSyncError> {
		match event {
			SyncEvent::ScanCompleted {
				wallet_id,
				kind,
				confirmed_balance,
				unconfirmed_delta,
				..
			} => info!(
				"[{}] {} scan done: {} SC confirmed, {:+} hastings pending",
				wallet_id,
				kind,
				format_token_amount(*confirmed_balance, 24),
				unconfirmed_delta
			),
			SyncEvent::ScanFailed {
				wallet_id,
				kind,
				error,
				..
			} => warn!("[{}] {} scan failed: {}", wallet_id, kind, error),
			SyncEvent::OfflineChanged { offline } => info!("Offline: {}", offline),
			SyncEvent::ScanStarted { .. } => {}
		}
		Ok(())
	}

	fn name(&self) -> &'static str {
		"logging"
	}
}

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting wallet sync service");
	if let Err(e) = run().await {
		error!("Wallet sync service stopped: {}", e);
	}
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
	let config = SyncConfig::from_env();

	let explorer_url =
		std::env::var("EXPLORER_URL").unwrap_or_else(|_| DEFAULT_EXPLORER_URL.to_string());
	let derivation_url =
		std::env::var("DERIVATION_RPC_URL").unwrap_or_else(|_| DEFAULT_DERIVATION_URL.to_string());
	let data_dir = std::env::var("WALLET_DATA_DIR").unwrap_or_else(|_| "wallet_data".to_string());
	let password = zeroize::Zeroizing::new(
		std::env::var("WALLET_PASSWORD")
			.map_err(|_| "WALLET_PASSWORD must be set to unlock the wallet store")?,
	);

	let chain = Arc::new(ExplorerClient::new(explorer_url, config.remote_timeout)?);
	info!("Created explorer client for {}", chain.base_url());
	let derivation = Arc::new(RpcDerivationModule::new(
		derivation_url,
		config.derivation_timeout,
	)?);

	let store = Arc::new(FileLedgerStore::open(data_dir).await?);
	let persistence = Arc::new(StatePersistenceService::new(store.clone()));

	let backends = BackendRegistry::new(
		Arc::new(DerivationBackend::new(
			derivation.clone(),
			chain,
			Arc::clone(&persistence),
			config.clone(),
		)),
		Arc::new(RemoteKeystoreBackend::new(
			Arc::new(WalrusConnector::new(config.remote_timeout)),
			Arc::clone(&persistence),
			config.clone(),
		)),
	);

	let scheduler = ScanScheduler::new(config, persistence, Arc::new(backends));
	scheduler
		.register_handler(Box::new(LoggingEventHandler))
		.await;

	let unlocked = scheduler.unlock(&password).await?;

	if let Ok(seed) = std::env::var("WALLET_SEED") {
		let wallet = Wallet::derived("default", SecretMaterial::new(seed), DEFAULT_CURRENCY);
		scheduler.add_wallet(wallet).await?;
	} else if unlocked == 0 && store.count_wallets().await? == 0 {
		info!("No wallets stored, generating a new seed");
		let seed = derivation.generate_seed("sia").await?;
		let wallet = Wallet::derived("default", seed, DEFAULT_CURRENCY);
		scheduler.add_wallet(wallet).await?;
	}

	tokio::signal::ctrl_c().await?;
	info!("Shutting down");
	scheduler.lock().await;
	Ok(())
}
