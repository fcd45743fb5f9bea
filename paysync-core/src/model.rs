//! Core data model: webhook events, purchase records, and reconciliation
//! findings.
//!
//! `WebhookEvent` rows are append-mostly: one row per provider `event_id`,
//! mutated only through status transitions and never deleted, so the table
//! doubles as the audit trail for every delivery attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing status of a received webhook event.
///
/// `Processed` and `Abandoned` are terminal; `Failed` events carry a
/// `next_retry_at` and are picked up by the retry scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Received,
    Processed,
    Failed,
    Abandoned,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Received => "received",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
            EventStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(EventStatus::Received),
            "processed" => Some(EventStatus::Processed),
            "failed" => Some(EventStatus::Failed),
            "abandoned" => Some(EventStatus::Abandoned),
            _ => None,
        }
    }
}

/// One received provider notification, keyed by the provider-assigned
/// `event_id`. Exactly one row exists per `event_id` regardless of how many
/// times the provider delivers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub raw_payload: String,
    pub status: EventStatus,
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Subscription status as reported by the payment provider. The provider is
/// authoritative for this field; the ledger only mirrors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    PastDue,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Incomplete => "incomplete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseType {
    OneTime,
    Subscription,
}

impl PurchaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseType::OneTime => "one_time",
            PurchaseType::Subscription => "subscription",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "one_time" => Some(PurchaseType::OneTime),
            "subscription" => Some(PurchaseType::Subscription),
            _ => None,
        }
    }
}

/// Provenance of a ledger write. Reconciliation- and manually-created rows
/// are flagged so that drift repairs remain visible in audits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseSource {
    Webhook,
    Reconciliation,
    Manual,
}

impl PurchaseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseSource::Webhook => "webhook",
            PurchaseSource::Reconciliation => "reconciliation",
            PurchaseSource::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "webhook" => Some(PurchaseSource::Webhook),
            "reconciliation" => Some(PurchaseSource::Reconciliation),
            "manual" => Some(PurchaseSource::Manual),
            _ => None,
        }
    }
}

/// Business-derived ledger key: `"{account_id}:{product_id}"`.
///
/// This is deliberately not the provider's internal primary key, which can
/// differ across redeliveries and migrations. All writers (webhook path,
/// retry path, reconciliation path) derive the same key from the same
/// payload fields, which is what makes ledger upserts commutative.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey(pub String);

impl NaturalKey {
    pub fn derive(account_id: &str, product_id: &str) -> Self {
        NaturalKey(format!("{}:{}", account_id, product_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One granted entitlement in the internal purchase ledger.
///
/// Rows are never deleted; deactivation is a `status` transition. The
/// `amount_paid`, `purchase_type`, and `source` fields are internal-authority
/// fields that reconciliation status repairs must never touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub natural_key: NaturalKey,
    pub subscription_id: String,
    pub status: SubscriptionStatus,
    pub amount_paid: i64,
    pub purchase_type: PurchaseType,
    pub source: PurchaseSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    MissingInLedger,
    OrphanedInLedger,
    StatusMismatch,
}

impl DiscrepancyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyKind::MissingInLedger => "missing_in_ledger",
            DiscrepancyKind::OrphanedInLedger => "orphaned_in_ledger",
            DiscrepancyKind::StatusMismatch => "status_mismatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyResolution {
    AutoFixed,
    Alerted,
    Ignored,
}

impl DiscrepancyResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyResolution::AutoFixed => "auto_fixed",
            DiscrepancyResolution::Alerted => "alerted",
            DiscrepancyResolution::Ignored => "ignored",
        }
    }
}

/// A single reconciliation finding. Findings are transient (carried in the
/// run report and the audit log), not a persisted system of record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub subscription_id: String,
    pub kind: DiscrepancyKind,
    pub resolution: DiscrepancyResolution,
    pub detected_at: DateTime<Utc>,
}

/// Which code path produced an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditActor {
    Webhook,
    Retry,
    Reconciliation,
    Manual,
}

impl AuditActor {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditActor::Webhook => "webhook",
            AuditActor::Retry => "retry",
            AuditActor::Reconciliation => "reconciliation",
            AuditActor::Manual => "manual",
        }
    }
}

/// Append-only audit trail entry. Written on every ingest outcome that
/// touched the store and on every reconciliation finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor: AuditActor,
    pub event_id: Option<String>,
    pub subscription_id: Option<String>,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(actor: AuditActor, detail: impl Into<String>, at: DateTime<Utc>) -> Self {
        AuditEntry {
            actor,
            event_id: None,
            subscription_id: None,
            detail: detail.into(),
            recorded_at: at,
        }
    }

    pub fn with_event(mut self, event_id: &str) -> Self {
        self.event_id = Some(event_id.to_string());
        self
    }

    pub fn with_subscription(mut self, subscription_id: &str) -> Self {
        self.subscription_id = Some(subscription_id.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_key_is_account_and_product() {
        let key = NaturalKey::derive("acct42", "prod7");
        assert_eq!(key.as_str(), "acct42:prod7");
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            EventStatus::Received,
            EventStatus::Processed,
            EventStatus::Failed,
            EventStatus::Abandoned,
        ] {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EventStatus::parse("bogus"), None);

        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Incomplete,
        ] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), Some(status));
        }

        for source in [
            PurchaseSource::Webhook,
            PurchaseSource::Reconciliation,
            PurchaseSource::Manual,
        ] {
            assert_eq!(PurchaseSource::parse(source.as_str()), Some(source));
        }
    }
}
