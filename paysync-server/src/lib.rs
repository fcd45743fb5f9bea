//! Payment webhook ingestion and ledger reconciliation service.
//!
//! The service accepts signed provider webhooks, applies each event to the
//! internal purchase ledger exactly once, retries transient failures on a
//! bounded backoff schedule, and periodically reconciles the ledger against
//! the provider's records. All durable state lives in SQLite; the schedulers
//! carry no in-memory retry state and survive restarts.

pub mod admin;
pub mod config;
pub mod ingest;
pub mod provider;
pub mod reconcile;
pub mod retry;
pub mod signature;
pub mod store;
pub mod webhook;

#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::provider::ProviderGateway;
use crate::reconcile::ReconciliationReport;
use crate::store::{EventStore, LedgerGateway};

/// Shared application state handed to every handler and scheduler.
pub struct AppState {
    pub config: Config,
    pub events: Arc<dyn EventStore>,
    pub ledger: Arc<dyn LedgerGateway>,
    pub provider: Arc<dyn ProviderGateway>,
    /// Most recent reconciliation report, feeding the health endpoint.
    /// Empty until the first run after startup.
    pub last_reconciliation: RwLock<Option<ReconciliationReport>>,
    /// Cancels in-flight reconciliation scans on shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Config,
        events: Arc<dyn EventStore>,
        ledger: Arc<dyn LedgerGateway>,
        provider: Arc<dyn ProviderGateway>,
    ) -> Self {
        AppState {
            config,
            events,
            ledger,
            provider,
            last_reconciliation: RwLock::new(None),
            shutdown: CancellationToken::new(),
        }
    }
}
