//! In-memory store implementations.
//!
//! Used by unit tests and useful for local experimentation; semantics mirror
//! the SQLite backend, including claim atomicity and the compare-and-set on
//! `updated_at`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use paysync_core::{
    AuditEntry, EventStatus, NaturalKey, PurchaseRecord, SubscriptionStatus, WebhookEvent,
};

use super::{ClaimResult, EventStore, LedgerError, LedgerGateway, StoreError};

#[derive(Default)]
pub struct InMemoryEventStore {
    events: RwLock<HashMap<String, WebhookEvent>>,
    audit: RwLock<Vec<AuditEntry>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the audit trail, oldest first.
    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.read().await.clone()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        raw_payload: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult, StoreError> {
        let mut events = self.events.write().await;

        match events.get_mut(event_id) {
            None => {
                events.insert(
                    event_id.to_string(),
                    WebhookEvent {
                        event_id: event_id.to_string(),
                        event_type: event_type.to_string(),
                        raw_payload: raw_payload.to_string(),
                        status: EventStatus::Received,
                        attempt_count: 1,
                        next_retry_at: None,
                        last_error: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(ClaimResult::Claimed { attempt: 1 })
            }
            Some(event) => match event.status {
                EventStatus::Processed | EventStatus::Abandoned => {
                    Ok(ClaimResult::AlreadyProcessed)
                }
                EventStatus::Received => Ok(ClaimResult::InFlight),
                EventStatus::Failed => {
                    event.status = EventStatus::Received;
                    event.attempt_count += 1;
                    event.updated_at = now;
                    Ok(ClaimResult::Claimed {
                        attempt: event.attempt_count,
                    })
                }
            },
        }
    }

    async fn mark_processed(&self, event_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut events = self.events.write().await;
        if let Some(event) = events.get_mut(event_id) {
            event.status = EventStatus::Processed;
            event.next_retry_at = None;
            event.updated_at = now;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: &str,
        error: &str,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut events = self.events.write().await;
        if let Some(event) = events.get_mut(event_id) {
            event.status = EventStatus::Failed;
            event.last_error = Some(error.to_string());
            event.next_retry_at = Some(next_retry_at);
            event.updated_at = now;
        }
        Ok(())
    }

    async fn mark_abandoned(
        &self,
        event_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut events = self.events.write().await;
        if let Some(event) = events.get_mut(event_id) {
            event.status = EventStatus::Abandoned;
            event.last_error = Some(error.to_string());
            event.next_retry_at = None;
            event.updated_at = now;
        }
        Ok(())
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: u32,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let events = self.events.read().await;
        let mut due: Vec<WebhookEvent> = events
            .values()
            .filter(|e| {
                e.status == EventStatus::Failed
                    && e.attempt_count < max_attempts
                    && e.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_retry_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn claim_retry(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut events = self.events.write().await;
        match events.get_mut(event_id) {
            Some(event) if event.status == EventStatus::Failed => {
                event.status = EventStatus::Received;
                event.attempt_count += 1;
                event.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<WebhookEvent>, StoreError> {
        Ok(self.events.read().await.get(event_id).cloned())
    }

    async fn recent_events(
        &self,
        status: Option<EventStatus>,
        limit: u32,
    ) -> Result<Vec<WebhookEvent>, StoreError> {
        let events = self.events.read().await;
        let mut matching: Vec<WebhookEvent> = events
            .values()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn count_unhealthy_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let events = self.events.read().await;
        Ok(events
            .values()
            .filter(|e| {
                matches!(e.status, EventStatus::Failed | EventStatus::Abandoned)
                    && e.updated_at >= since
            })
            .count() as u64)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.audit.write().await.push(entry.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryLedger {
    rows: RwLock<HashMap<String, PurchaseRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_rows(&self) -> Vec<PurchaseRecord> {
        self.rows.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl LedgerGateway for InMemoryLedger {
    async fn upsert_purchase(&self, record: &PurchaseRecord) -> Result<(), LedgerError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(record.natural_key.as_str()) {
            Some(existing) => {
                existing.subscription_id = record.subscription_id.clone();
                existing.status = record.status;
                existing.amount_paid = record.amount_paid;
                existing.purchase_type = record.purchase_type;
                existing.updated_at = record.updated_at;
            }
            None => {
                rows.insert(record.natural_key.as_str().to_string(), record.clone());
            }
        }
        Ok(())
    }

    async fn insert_if_absent(&self, record: &PurchaseRecord) -> Result<bool, LedgerError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(record.natural_key.as_str()) {
            return Ok(false);
        }
        rows.insert(record.natural_key.as_str().to_string(), record.clone());
        Ok(true)
    }

    async fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<PurchaseRecord>, LedgerError> {
        Ok(self.rows.read().await.get(key.as_str()).cloned())
    }

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<PurchaseRecord>, LedgerError> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|r| r.subscription_id == subscription_id)
            .max_by_key(|r| r.updated_at)
            .cloned())
    }

    async fn update_status(
        &self,
        key: &NaturalKey,
        status: SubscriptionStatus,
        expected_updated_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(key.as_str()) {
            Some(row) if row.updated_at == expected_updated_at => {
                row.status = status;
                row.updated_at = now;
                Ok(())
            }
            _ => Err(LedgerError::Conflict),
        }
    }

    async fn active_purchases(&self) -> Result<Vec<PurchaseRecord>, LedgerError> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|r| r.status == SubscriptionStatus::Active)
            .cloned()
            .collect())
    }
}
