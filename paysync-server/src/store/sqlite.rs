//! SQLite persistence for webhook events, the purchase ledger, and the
//! audit trail.
//!
//! A single database file backs all three tables. The connection lives in an
//! `Arc<Mutex<Connection>>` because `rusqlite::Connection` is not `Sync`; the
//! async trait methods run every statement inside
//! `tokio::task::spawn_blocking`.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema versions.
//! When the schema changes, increment `SCHEMA_VERSION` and add a migration
//! function in `run_migrations`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use paysync_core::{
    AuditEntry, EventStatus, NaturalKey, PurchaseRecord, PurchaseSource, PurchaseType,
    SubscriptionStatus, WebhookEvent,
};

use super::{ClaimResult, EventStore, LedgerError, LedgerGateway, StoreError};

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

/// Timestamps are stored as RFC 3339 text with microsecond precision so that
/// lexicographic comparison in SQL matches chronological order and the
/// compare-and-set on `updated_at` round-trips exactly.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::corruption(format!("bad timestamp '{s}': {e}")))
}

impl SqliteStore {
    /// Open or create the database file at the given path.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;

        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current_version > SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                current_version,
                SCHEMA_VERSION
            );
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }

        // Future migrations go here:
        // if from_version < 2 {
        //     Self::migrate_v1_to_v2(conn)?;
        // }

        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS webhook_events (
                event_id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                raw_payload TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN (
                    'received', 'processed', 'failed', 'abandoned'
                )),
                attempt_count INTEGER NOT NULL,
                next_retry_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_due_retry
            ON webhook_events(next_retry_at)
            WHERE status = 'failed';

            CREATE TABLE IF NOT EXISTS purchases (
                natural_key TEXT PRIMARY KEY,
                subscription_id TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN (
                    'active', 'canceled', 'past_due', 'incomplete'
                )),
                amount_paid INTEGER NOT NULL,
                purchase_type TEXT NOT NULL CHECK(purchase_type IN (
                    'one_time', 'subscription'
                )),
                source TEXT NOT NULL CHECK(source IN (
                    'webhook', 'reconciliation', 'manual'
                )),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_purchases_subscription
            ON purchases(subscription_id);

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                actor TEXT NOT NULL,
                event_id TEXT,
                subscription_id TEXT,
                detail TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create initial schema (v0 -> v1)")?;

        Ok(())
    }
}

// =============================================================================
// Synchronous statement helpers
// =============================================================================

fn claim_event_sync(
    conn: &Connection,
    event_id: &str,
    event_type: &str,
    raw_payload: &str,
    now: &str,
) -> Result<ClaimResult, String> {
    // Atomic INSERT OR IGNORE avoids the read-then-insert race: if two
    // deliveries arrive concurrently, the loser's insert is silently ignored
    // and detected via changes() == 0.
    conn.execute(
        "INSERT OR IGNORE INTO webhook_events \
         (event_id, event_type, raw_payload, status, attempt_count, created_at, updated_at) \
         VALUES (?1, ?2, ?3, 'received', 1, ?4, ?4)",
        params![event_id, event_type, raw_payload, now],
    )
    .map_err(|e| e.to_string())?;

    if conn.changes() > 0 {
        return Ok(ClaimResult::Claimed { attempt: 1 });
    }

    let status: String = conn
        .query_row(
            "SELECT status FROM webhook_events WHERE event_id = ?1",
            params![event_id],
            |row| row.get(0),
        )
        .map_err(|e| e.to_string())?;

    match status.as_str() {
        "processed" | "abandoned" => Ok(ClaimResult::AlreadyProcessed),
        "received" => Ok(ClaimResult::InFlight),
        "failed" => {
            // Provider redelivery of a failed event counts as an attempt.
            // The conditional UPDATE guards against a concurrent scheduler
            // claiming the same event.
            conn.execute(
                "UPDATE webhook_events \
                 SET status = 'received', attempt_count = attempt_count + 1, updated_at = ?1 \
                 WHERE event_id = ?2 AND status = 'failed'",
                params![now, event_id],
            )
            .map_err(|e| e.to_string())?;

            if conn.changes() > 0 {
                let attempt: u32 = conn
                    .query_row(
                        "SELECT attempt_count FROM webhook_events WHERE event_id = ?1",
                        params![event_id],
                        |row| row.get(0),
                    )
                    .map_err(|e| e.to_string())?;
                Ok(ClaimResult::Claimed { attempt })
            } else {
                Ok(ClaimResult::InFlight)
            }
        }
        other => Err(format!("unexpected event status '{other}'")),
    }
}

fn set_terminal_sync(
    conn: &Connection,
    event_id: &str,
    status: &str,
    error: Option<&str>,
    now: &str,
) -> Result<(), String> {
    conn.execute(
        "UPDATE webhook_events \
         SET status = ?1, last_error = COALESCE(?2, last_error), next_retry_at = NULL, \
             updated_at = ?3 \
         WHERE event_id = ?4",
        params![status, error, now, event_id],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

fn mark_failed_sync(
    conn: &Connection,
    event_id: &str,
    error: &str,
    next_retry_at: &str,
    now: &str,
) -> Result<(), String> {
    conn.execute(
        "UPDATE webhook_events \
         SET status = 'failed', last_error = ?1, next_retry_at = ?2, updated_at = ?3 \
         WHERE event_id = ?4",
        params![error, next_retry_at, now, event_id],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

struct EventRow {
    event_id: String,
    event_type: String,
    raw_payload: String,
    status: String,
    attempt_count: u32,
    next_retry_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

const EVENT_COLUMNS: &str = "event_id, event_type, raw_payload, status, attempt_count, \
                             next_retry_at, last_error, created_at, updated_at";

fn read_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        event_id: row.get(0)?,
        event_type: row.get(1)?,
        raw_payload: row.get(2)?,
        status: row.get(3)?,
        attempt_count: row.get(4)?,
        next_retry_at: row.get(5)?,
        last_error: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_event(row: EventRow) -> Result<WebhookEvent, StoreError> {
    let status = EventStatus::parse(&row.status)
        .ok_or_else(|| StoreError::corruption(format!("unknown event status '{}'", row.status)))?;
    let next_retry_at = row.next_retry_at.as_deref().map(parse_ts).transpose()?;

    Ok(WebhookEvent {
        event_id: row.event_id,
        event_type: row.event_type,
        raw_payload: row.raw_payload,
        status,
        attempt_count: row.attempt_count,
        next_retry_at,
        last_error: row.last_error,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

struct PurchaseRow {
    natural_key: String,
    subscription_id: String,
    status: String,
    amount_paid: i64,
    purchase_type: String,
    source: String,
    created_at: String,
    updated_at: String,
}

const PURCHASE_COLUMNS: &str = "natural_key, subscription_id, status, amount_paid, \
                                purchase_type, source, created_at, updated_at";

fn read_purchase_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PurchaseRow> {
    Ok(PurchaseRow {
        natural_key: row.get(0)?,
        subscription_id: row.get(1)?,
        status: row.get(2)?,
        amount_paid: row.get(3)?,
        purchase_type: row.get(4)?,
        source: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_purchase(row: PurchaseRow) -> Result<PurchaseRecord, LedgerError> {
    let corrupt = |what: &str, value: &str| {
        LedgerError::Unavailable(format!("stored purchase has unknown {what} '{value}'"))
    };

    Ok(PurchaseRecord {
        natural_key: NaturalKey(row.natural_key),
        subscription_id: row.subscription_id,
        status: SubscriptionStatus::parse(&row.status)
            .ok_or_else(|| corrupt("status", &row.status))?,
        amount_paid: row.amount_paid,
        purchase_type: PurchaseType::parse(&row.purchase_type)
            .ok_or_else(|| corrupt("purchase_type", &row.purchase_type))?,
        source: PurchaseSource::parse(&row.source).ok_or_else(|| corrupt("source", &row.source))?,
        created_at: DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| LedgerError::Unavailable(format!("bad created_at: {e}")))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&row.updated_at)
            .map_err(|e| LedgerError::Unavailable(format!("bad updated_at: {e}")))?
            .with_timezone(&Utc),
    })
}

// =============================================================================
// Async trait implementations
// =============================================================================

impl SqliteStore {
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, String> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            f(&conn).map_err(|e| StoreError::storage(operation, e))
        })
        .await
        .map_err(|e| StoreError::storage(operation, e.to_string()))?
    }

    async fn with_conn_ledger<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, LedgerError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| LedgerError::Unavailable(e.to_string()))?
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        raw_payload: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult, StoreError> {
        let event_id = event_id.to_string();
        let event_type = event_type.to_string();
        let raw_payload = raw_payload.to_string();
        let now = ts(now);
        self.with_conn("claim_event", move |conn| {
            claim_event_sync(conn, &event_id, &event_type, &raw_payload, &now)
        })
        .await
    }

    async fn mark_processed(&self, event_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let event_id = event_id.to_string();
        let now = ts(now);
        self.with_conn("mark_processed", move |conn| {
            set_terminal_sync(conn, &event_id, "processed", None, &now)
        })
        .await
    }

    async fn mark_failed(
        &self,
        event_id: &str,
        error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let event_id = event_id.to_string();
        let error = error.to_string();
        let next_retry_at = ts(next_retry_at);
        let now = ts(now);
        self.with_conn("mark_failed", move |conn| {
            mark_failed_sync(conn, &event_id, &error, &next_retry_at, &now)
        })
        .await
    }

    async fn mark_abandoned(
        &self,
        event_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let event_id = event_id.to_string();
        let error = error.to_string();
        let now = ts(now);
        self.with_conn("mark_abandoned", move |conn| {
            set_terminal_sync(conn, &event_id, "abandoned", Some(&error), &now)
        })
        .await
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: u32,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let now = ts(now);
        let rows = self
            .with_conn("due_retries", move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {EVENT_COLUMNS} FROM webhook_events \
                         WHERE status = 'failed' AND next_retry_at IS NOT NULL \
                           AND next_retry_at <= ?1 AND attempt_count < ?2 \
                         ORDER BY next_retry_at ASC LIMIT ?3"
                    ))
                    .map_err(|e| e.to_string())?;
                let rows = stmt
                    .query_map(params![now, max_attempts, limit], read_event_row)
                    .map_err(|e| e.to_string())?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| e.to_string())
            })
            .await?;

        rows.into_iter().map(row_to_event).collect()
    }

    async fn claim_retry(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let event_id = event_id.to_string();
        let now = ts(now);
        self.with_conn("claim_retry", move |conn| {
            conn.execute(
                "UPDATE webhook_events \
                 SET status = 'received', attempt_count = attempt_count + 1, updated_at = ?1 \
                 WHERE event_id = ?2 AND status = 'failed'",
                params![now, event_id],
            )
            .map_err(|e| e.to_string())?;
            Ok(conn.changes() > 0)
        })
        .await
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<WebhookEvent>, StoreError> {
        let event_id = event_id.to_string();
        let row = self
            .with_conn("get_event", move |conn| {
                conn.query_row(
                    &format!("SELECT {EVENT_COLUMNS} FROM webhook_events WHERE event_id = ?1"),
                    params![event_id],
                    read_event_row,
                )
                .optional()
                .map_err(|e| e.to_string())
            })
            .await?;

        row.map(row_to_event).transpose()
    }

    async fn recent_events(
        &self,
        status: Option<EventStatus>,
        limit: u32,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let status = status.map(|s| s.as_str().to_string());
        let rows = self
            .with_conn("recent_events", move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {EVENT_COLUMNS} FROM webhook_events \
                         WHERE (?1 IS NULL OR status = ?1) \
                         ORDER BY updated_at DESC LIMIT ?2"
                    ))
                    .map_err(|e| e.to_string())?;
                let rows = stmt
                    .query_map(params![status, limit], read_event_row)
                    .map_err(|e| e.to_string())?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| e.to_string())
            })
            .await?;

        rows.into_iter().map(row_to_event).collect()
    }

    async fn count_unhealthy_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let since = ts(since);
        self.with_conn("count_unhealthy_since", move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM webhook_events \
                 WHERE status IN ('failed', 'abandoned') AND updated_at >= ?1",
                params![since],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(|e| e.to_string())
        })
        .await
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let entry = entry.clone();
        self.with_conn("append_audit", move |conn| {
            conn.execute(
                "INSERT INTO audit_log (actor, event_id, subscription_id, detail, recorded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.actor.as_str(),
                    entry.event_id,
                    entry.subscription_id,
                    entry.detail,
                    ts(entry.recorded_at),
                ],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl LedgerGateway for SqliteStore {
    async fn upsert_purchase(&self, record: &PurchaseRecord) -> Result<(), LedgerError> {
        let record = record.clone();
        self.with_conn_ledger(move |conn| {
            // `source` and `created_at` record provenance of the original
            // insert and are not rewritten by replays.
            conn.execute(
                "INSERT INTO purchases \
                 (natural_key, subscription_id, status, amount_paid, purchase_type, source, \
                  created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT (natural_key) DO UPDATE SET \
                     subscription_id = excluded.subscription_id, \
                     status = excluded.status, \
                     amount_paid = excluded.amount_paid, \
                     purchase_type = excluded.purchase_type, \
                     updated_at = excluded.updated_at",
                params![
                    record.natural_key.as_str(),
                    record.subscription_id,
                    record.status.as_str(),
                    record.amount_paid,
                    record.purchase_type.as_str(),
                    record.source.as_str(),
                    ts(record.created_at),
                    ts(record.updated_at),
                ],
            )
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn insert_if_absent(&self, record: &PurchaseRecord) -> Result<bool, LedgerError> {
        let record = record.clone();
        self.with_conn_ledger(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO purchases \
                 (natural_key, subscription_id, status, amount_paid, purchase_type, source, \
                  created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.natural_key.as_str(),
                    record.subscription_id,
                    record.status.as_str(),
                    record.amount_paid,
                    record.purchase_type.as_str(),
                    record.source.as_str(),
                    ts(record.created_at),
                    ts(record.updated_at),
                ],
            )
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
            Ok(conn.changes() > 0)
        })
        .await
    }

    async fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<PurchaseRecord>, LedgerError> {
        let key = key.as_str().to_string();
        let row = self
            .with_conn_ledger(move |conn| {
                conn.query_row(
                    &format!("SELECT {PURCHASE_COLUMNS} FROM purchases WHERE natural_key = ?1"),
                    params![key],
                    read_purchase_row,
                )
                .optional()
                .map_err(|e| LedgerError::Unavailable(e.to_string()))
            })
            .await?;

        row.map(row_to_purchase).transpose()
    }

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<PurchaseRecord>, LedgerError> {
        let subscription_id = subscription_id.to_string();
        let row = self
            .with_conn_ledger(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {PURCHASE_COLUMNS} FROM purchases \
                         WHERE subscription_id = ?1 ORDER BY updated_at DESC LIMIT 1"
                    ),
                    params![subscription_id],
                    read_purchase_row,
                )
                .optional()
                .map_err(|e| LedgerError::Unavailable(e.to_string()))
            })
            .await?;

        row.map(row_to_purchase).transpose()
    }

    async fn update_status(
        &self,
        key: &NaturalKey,
        status: SubscriptionStatus,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let key = key.as_str().to_string();
        let expected = ts(expected_updated_at);
        let now = ts(now);
        self.with_conn_ledger(move |conn| {
            conn.execute(
                "UPDATE purchases SET status = ?1, updated_at = ?2 \
                 WHERE natural_key = ?3 AND updated_at = ?4",
                params![status.as_str(), now, key, expected],
            )
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

            if conn.changes() > 0 {
                Ok(())
            } else {
                Err(LedgerError::Conflict)
            }
        })
        .await
    }

    async fn active_purchases(&self) -> Result<Vec<PurchaseRecord>, LedgerError> {
        let rows = self
            .with_conn_ledger(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {PURCHASE_COLUMNS} FROM purchases WHERE status = 'active'"
                    ))
                    .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
                let rows = stmt
                    .query_map([], read_purchase_row)
                    .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| LedgerError::Unavailable(e.to_string()))
            })
            .await?;

        rows.into_iter().map(row_to_purchase).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use paysync_core::AuditActor;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn purchase(key: &str, sub: &str, status: SubscriptionStatus) -> PurchaseRecord {
        PurchaseRecord {
            natural_key: NaturalKey(key.to_string()),
            subscription_id: sub.to_string(),
            status,
            amount_paid: 2999,
            purchase_type: PurchaseType::Subscription,
            source: PurchaseSource::Webhook,
            created_at: t0(),
            updated_at: t0(),
        }
    }

    #[tokio::test]
    async fn claim_new_event_then_redelivery() {
        let store = SqliteStore::new_in_memory().unwrap();

        let claim = store
            .claim_event("evt_1", "subscription.created", "{}", t0())
            .await
            .unwrap();
        assert_eq!(claim, ClaimResult::Claimed { attempt: 1 });

        // Concurrent delivery while still in flight
        let claim = store
            .claim_event("evt_1", "subscription.created", "{}", t0())
            .await
            .unwrap();
        assert_eq!(claim, ClaimResult::InFlight);

        store.mark_processed("evt_1", t0()).await.unwrap();

        let claim = store
            .claim_event("evt_1", "subscription.created", "{}", t0())
            .await
            .unwrap();
        assert_eq!(claim, ClaimResult::AlreadyProcessed);
    }

    #[tokio::test]
    async fn redelivery_of_failed_event_increments_attempt() {
        let store = SqliteStore::new_in_memory().unwrap();

        store
            .claim_event("evt_1", "payment.succeeded", "{}", t0())
            .await
            .unwrap();
        store
            .mark_failed("evt_1", "ledger timeout", t0() + Duration::minutes(5), t0())
            .await
            .unwrap();

        let claim = store
            .claim_event("evt_1", "payment.succeeded", "{}", t0())
            .await
            .unwrap();
        assert_eq!(claim, ClaimResult::Claimed { attempt: 2 });
    }

    #[tokio::test]
    async fn abandoned_event_acknowledged_without_reclaim() {
        let store = SqliteStore::new_in_memory().unwrap();

        store
            .claim_event("evt_1", "payment.succeeded", "{}", t0())
            .await
            .unwrap();
        store
            .mark_abandoned("evt_1", "gave up", t0())
            .await
            .unwrap();

        let claim = store
            .claim_event("evt_1", "payment.succeeded", "{}", t0())
            .await
            .unwrap();
        assert_eq!(claim, ClaimResult::AlreadyProcessed);

        let event = store.get_event("evt_1").await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Abandoned);
        assert_eq!(event.attempt_count, 1);
    }

    #[tokio::test]
    async fn due_retries_ordered_and_filtered() {
        let store = SqliteStore::new_in_memory().unwrap();
        let now = t0();

        for (id, offset) in [("evt_late", 10), ("evt_early", 2), ("evt_future", 60)] {
            store
                .claim_event(id, "payment.succeeded", "{}", now)
                .await
                .unwrap();
            store
                .mark_failed(id, "err", now + Duration::minutes(offset), now)
                .await
                .unwrap();
        }

        // Exhausted event must not come back even when due
        store
            .claim_event("evt_spent", "payment.succeeded", "{}", now)
            .await
            .unwrap();
        let spent = store.get_event("evt_spent").await.unwrap().unwrap();
        assert_eq!(spent.attempt_count, 1);
        store
            .mark_failed("evt_spent", "err", now, now)
            .await
            .unwrap();
        store.claim_retry("evt_spent", now).await.unwrap();
        store
            .mark_failed("evt_spent", "err", now, now)
            .await
            .unwrap();
        store.claim_retry("evt_spent", now).await.unwrap();
        store
            .mark_failed("evt_spent", "err", now, now)
            .await
            .unwrap();

        let due = store
            .due_retries(now + Duration::minutes(30), 3, 10)
            .await
            .unwrap();
        let ids: Vec<&str> = due.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["evt_early", "evt_late"]);
    }

    #[tokio::test]
    async fn claim_retry_only_flips_failed_events() {
        let store = SqliteStore::new_in_memory().unwrap();

        store
            .claim_event("evt_1", "payment.succeeded", "{}", t0())
            .await
            .unwrap();
        assert!(!store.claim_retry("evt_1", t0()).await.unwrap());

        store
            .mark_failed("evt_1", "err", t0() + Duration::minutes(5), t0())
            .await
            .unwrap();
        assert!(store.claim_retry("evt_1", t0()).await.unwrap());
        // Second scheduler loses the race
        assert!(!store.claim_retry("evt_1", t0()).await.unwrap());

        let event = store.get_event("evt_1").await.unwrap().unwrap();
        assert_eq!(event.attempt_count, 2);
        assert_eq!(event.status, EventStatus::Received);
    }

    #[tokio::test]
    async fn upsert_purchase_is_replay_safe() {
        let store = SqliteStore::new_in_memory().unwrap();
        let record = purchase("acct42:prod7", "sub_1", SubscriptionStatus::Active);

        store.upsert_purchase(&record).await.unwrap();
        store.upsert_purchase(&record).await.unwrap();

        let loaded = store
            .find_by_natural_key(&NaturalKey("acct42:prod7".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, record);
        assert_eq!(store.active_purchases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insert_if_absent_does_not_overwrite() {
        let store = SqliteStore::new_in_memory().unwrap();
        let original = purchase("acct42:prod7", "sub_1", SubscriptionStatus::Active);
        store.upsert_purchase(&original).await.unwrap();

        let mut competing = purchase("acct42:prod7", "sub_1", SubscriptionStatus::Canceled);
        competing.source = PurchaseSource::Reconciliation;
        let inserted = store.insert_if_absent(&competing).await.unwrap();
        assert!(!inserted);

        let loaded = store
            .find_by_natural_key(&original.natural_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, SubscriptionStatus::Active);
        assert_eq!(loaded.source, PurchaseSource::Webhook);
    }

    #[tokio::test]
    async fn update_status_is_compare_and_set() {
        let store = SqliteStore::new_in_memory().unwrap();
        let record = purchase("acct42:prod7", "sub_1", SubscriptionStatus::Active);
        store.upsert_purchase(&record).await.unwrap();

        let later = t0() + Duration::minutes(1);
        store
            .update_status(
                &record.natural_key,
                SubscriptionStatus::PastDue,
                record.updated_at,
                later,
            )
            .await
            .unwrap();

        // Stale expectation loses
        let result = store
            .update_status(
                &record.natural_key,
                SubscriptionStatus::Canceled,
                record.updated_at,
                later + Duration::minutes(1),
            )
            .await;
        assert_eq!(result, Err(LedgerError::Conflict));

        let loaded = store
            .find_by_natural_key(&record.natural_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, SubscriptionStatus::PastDue);
        // Internal-authority fields untouched
        assert_eq!(loaded.amount_paid, 2999);
        assert_eq!(loaded.source, PurchaseSource::Webhook);
    }

    #[tokio::test]
    async fn audit_entries_append() {
        let store = SqliteStore::new_in_memory().unwrap();
        let entry = AuditEntry::new(AuditActor::Webhook, "processed evt_1", t0())
            .with_event("evt_1")
            .with_subscription("sub_1");
        store.append_audit(&entry).await.unwrap();
        store.append_audit(&entry).await.unwrap();
    }

    #[tokio::test]
    async fn count_unhealthy_respects_window() {
        let store = SqliteStore::new_in_memory().unwrap();
        let now = t0();

        store
            .claim_event("evt_old", "payment.failed", "{}", now - Duration::days(3))
            .await
            .unwrap();
        store
            .mark_abandoned("evt_old", "err", now - Duration::days(3))
            .await
            .unwrap();

        store
            .claim_event("evt_new", "payment.failed", "{}", now)
            .await
            .unwrap();
        store
            .mark_failed("evt_new", "err", now + Duration::minutes(5), now)
            .await
            .unwrap();

        let count = store
            .count_unhealthy_since(now - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        // Opening the same database twice should not fail
        let temp_dir = std::env::temp_dir();
        let db_path = temp_dir.join(format!("paysync_idempotent_{}.db", std::process::id()));

        {
            let _store = SqliteStore::new(&db_path).expect("first open should succeed");
        }

        {
            let _store = SqliteStore::new(&db_path).expect("second open should succeed");
        }

        std::fs::remove_file(&db_path).ok();
    }

    #[test]
    fn test_rejects_newer_schema_version() {
        let temp_dir = std::env::temp_dir();
        let db_path = temp_dir.join(format!("paysync_version_{}.db", std::process::id()));

        {
            let conn = Connection::open(&db_path).expect("should open");
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
                .expect("should set version");
        }

        match SqliteStore::new(&db_path) {
            Ok(_) => panic!("should reject newer schema version"),
            Err(e) => assert!(e.to_string().contains("newer than supported")),
        }

        std::fs::remove_file(&db_path).ok();
    }
}
