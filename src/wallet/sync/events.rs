//! Event system for wallet synchronization.
//!
//! The scheduler reports scan lifecycle changes as `SyncEvent`s. Observers
//! register a `SyncEventHandler` with the dispatcher instead of polling wallet
//! state, which keeps presentation concerns out of the engine.

use crate::wallet::WalletSyncError;
use crate::wallet::sync::backends::ScanReport;
use crate::wallet::types::{Currency, ScanKind, WalletId};

/// Events that occur during wallet synchronization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A queued scan was claimed by the executor
    ScanStarted { wallet_id: WalletId, kind: ScanKind },
    /// Discovery and balance sync finished and the result was committed
    ScanCompleted {
        wallet_id: WalletId,
        kind: ScanKind,
        report: ScanReport,
        confirmed_balance: Currency,
        unconfirmed_delta: i128,
    },
    /// The scan ended with an error; cached state is unchanged
    ScanFailed {
        wallet_id: WalletId,
        kind: ScanKind,
        error: String,
        transient: bool,
    },
    /// The process-wide offline indicator flipped
    OfflineChanged { offline: bool },
}

/// Trait for handling sync events
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    /// Handle a sync event.
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), WalletSyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
///
/// Handlers are called in registration order.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Box<dyn SyncEventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Box<dyn SyncEventHandler>) {
        self.handlers.push(handler);
    }

    /// Dispatch an event to all registered handlers.
    ///
    /// Errors from handlers are logged, but do not stop other handlers from running.
    pub async fn dispatch(&mut self, event: &SyncEvent) {
        for handler in &mut self.handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!("Handler {} failed to process event: {}", handler.name(), e);
            }
        }
    }
}
