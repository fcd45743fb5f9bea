//! Storage abstractions for webhook events, the purchase ledger, and the
//! audit trail.
//!
//! Two traits split the concerns: [`EventStore`] owns webhook delivery state
//! (claims, retry bookkeeping, audit entries) and [`LedgerGateway`] owns
//! purchase records. The SQLite backend implements both on one database;
//! tests use the in-memory implementations.

mod memory;
mod sqlite;

pub use memory::{InMemoryEventStore, InMemoryLedger};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paysync_core::{
    AuditEntry, EventStatus, NaturalKey, PurchaseRecord, SubscriptionStatus, WebhookEvent,
};

/// Error from the event store backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The storage operation failed.
    Storage {
        /// The operation that failed (e.g., "claim_event").
        operation: String,
        message: String,
    },
    /// A stored row could not be decoded back into domain types.
    Corruption { message: String },
}

impl StoreError {
    pub fn storage(operation: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Storage {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        StoreError::Corruption {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Storage { operation, message } => {
                write!(f, "storage operation '{operation}' failed: {message}")
            }
            StoreError::Corruption { message } => write!(f, "stored data corrupted: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Error from the ledger backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A compare-and-set update lost a race with a concurrent writer.
    /// Transient: the next reconciliation pass re-reads and retries.
    Conflict,
    Unavailable(String),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Conflict => write!(f, "ledger row changed concurrently"),
            LedgerError::Unavailable(msg) => write!(f, "ledger unavailable: {msg}"),
        }
    }
}

impl std::error::Error for LedgerError {}

/// Result of the atomic idempotency claim for an incoming event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    /// We own processing for this delivery. `attempt` is 1 for a new event
    /// id, or the incremented count when re-claiming a failed event.
    Claimed { attempt: u32 },
    /// The event already reached a terminal state (processed or abandoned).
    AlreadyProcessed,
    /// Another delivery of the same event is being processed right now.
    InFlight,
}

/// Durable store for webhook delivery state.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically claim an event id for processing. A single conditional
    /// write decides between first delivery, redelivery of a terminal event,
    /// redelivery of a failed event, and a concurrent in-flight delivery.
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        raw_payload: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult, StoreError>;

    async fn mark_processed(&self, event_id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Record a processing failure and schedule the next retry.
    async fn mark_failed(
        &self,
        event_id: &str,
        error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Record a final failure: the attempt budget is spent and the event
    /// will never be retried automatically.
    async fn mark_abandoned(&self, event_id: &str, error: &str, now: DateTime<Utc>)
        -> Result<(), StoreError>;

    /// Events due for retry: failed, `next_retry_at <= now`, attempts left.
    /// Ordered oldest `next_retry_at` first, at most `limit` rows.
    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: u32,
    ) -> Result<Vec<WebhookEvent>, StoreError>;

    /// Conditionally flip a failed event back to `received` for a retry
    /// attempt. Returns false if another scheduler got there first.
    async fn claim_retry(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn get_event(&self, event_id: &str) -> Result<Option<WebhookEvent>, StoreError>;

    /// Most recent events, optionally filtered by status.
    async fn recent_events(
        &self,
        status: Option<EventStatus>,
        limit: u32,
    ) -> Result<Vec<WebhookEvent>, StoreError>;

    /// Count of events currently failed or abandoned, updated since `since`.
    async fn count_unhealthy_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}

/// Durable store for the purchase ledger.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Insert or update the row for `record.natural_key`. Replay-safe: the
    /// webhook path applies the same event any number of times and converges
    /// on the same row.
    async fn upsert_purchase(&self, record: &PurchaseRecord) -> Result<(), LedgerError>;

    /// Insert only if no row exists for the natural key. Returns false when
    /// the row was already present. Used by reconciliation so a webhook that
    /// races the scan is never overwritten.
    async fn insert_if_absent(&self, record: &PurchaseRecord) -> Result<bool, LedgerError>;

    async fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<PurchaseRecord>, LedgerError>;

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<PurchaseRecord>, LedgerError>;

    /// Compare-and-set status update: succeeds only if the row's
    /// `updated_at` still matches `expected_updated_at`. Touches nothing but
    /// `status` and `updated_at`.
    async fn update_status(
        &self,
        key: &NaturalKey,
        status: SubscriptionStatus,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    /// All ledger rows with status `active`.
    async fn active_purchases(&self) -> Result<Vec<PurchaseRecord>, LedgerError>;
}
