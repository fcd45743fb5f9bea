//! Webhook ingestion: signature check, parse, idempotency claim, ledger
//! mutation, outcome bookkeeping.
//!
//! The ingestor guarantees at-most-one application of each event's ledger
//! effect while tolerating at-least-once delivery from the provider. The
//! idempotency claim is a single conditional write in the EventStore, so two
//! concurrent deliveries of the same `event_id` can never both reach the
//! ledger.
//!
//! A crash between the claim and the outcome write strands the row in
//! `received`: redeliveries are acknowledged and the retry scheduler only
//! selects `failed` rows, so the lost ledger effect is recovered by
//! reconciliation, not by the retry path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use paysync_core::{
    parse_event, AuditActor, AuditEntry, ProviderEvent, PurchaseRecord, PurchaseSource,
    RetryPolicy, SubscriptionDetails,
};

use crate::signature::verify_signature;
use crate::store::{ClaimResult, EventStore, LedgerError, LedgerGateway, StoreError};

/// Why a delivery was rejected outright. Rejections are never recorded in
/// the EventStore: an unauthenticated caller must not be able to pollute the
/// audit log with arbitrary event ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    AuthError,
    MalformedPayload,
}

/// Outcome of one delivery. Everything except `Rejected` is acknowledged to
/// the provider with a 200 so redelivery stops; business-effect failures are
/// recovered by the retry scheduler and reconciliation, invisibly to the
/// provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The ledger mutation was applied.
    Accepted,
    /// This event id already reached a terminal state, or another delivery
    /// of it is being processed right now. No side effects.
    AlreadyProcessed,
    /// Valid event of a type we do not act on. Recorded and acknowledged.
    Unhandled,
    Rejected(RejectReason),
    /// The ledger mutation failed transiently; the event is parked for the
    /// retry scheduler (or abandoned if the attempt budget is spent).
    Deferred { error: String },
}

pub struct WebhookIngestor {
    secret: String,
    policy: RetryPolicy,
    events: Arc<dyn EventStore>,
    ledger: Arc<dyn LedgerGateway>,
}

impl WebhookIngestor {
    pub fn new(
        secret: impl Into<String>,
        policy: RetryPolicy,
        events: Arc<dyn EventStore>,
        ledger: Arc<dyn LedgerGateway>,
    ) -> Self {
        WebhookIngestor {
            secret: secret.into(),
            policy,
            events,
            ledger,
        }
    }

    /// Handle one inbound delivery end to end.
    pub async fn handle(
        &self,
        raw_payload: &[u8],
        signature: Option<&str>,
    ) -> Result<Outcome, StoreError> {
        let Some(signature) = signature else {
            warn!("webhook delivery without signature header");
            return Ok(Outcome::Rejected(RejectReason::AuthError));
        };
        if !verify_signature(&self.secret, raw_payload, signature) {
            warn!("webhook delivery with invalid signature");
            return Ok(Outcome::Rejected(RejectReason::AuthError));
        }

        let parsed = match parse_event(raw_payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "webhook payload failed to parse");
                return Ok(Outcome::Rejected(RejectReason::MalformedPayload));
            }
        };

        let raw_text = String::from_utf8_lossy(raw_payload);
        let now = Utc::now();

        let claim = self
            .events
            .claim_event(&parsed.event_id, &parsed.event_type, &raw_text, now)
            .await?;

        let attempt = match claim {
            ClaimResult::AlreadyProcessed => {
                info!(event_id = %parsed.event_id, "event already processed, acknowledging");
                return Ok(Outcome::AlreadyProcessed);
            }
            // A concurrent delivery owns the claim. Acknowledging is safe:
            // if that delivery fails, its retry state is durable and the
            // scheduler picks it up.
            ClaimResult::InFlight => {
                info!(event_id = %parsed.event_id, "event claimed by concurrent delivery");
                return Ok(Outcome::AlreadyProcessed);
            }
            ClaimResult::Claimed { attempt } => attempt,
        };

        self.process_claimed(&parsed.event_id, &parsed.event, attempt, AuditActor::Webhook, now)
            .await
    }

    /// Apply the ledger effect of a claimed event and record the outcome.
    /// Shared between fresh deliveries and the retry scheduler, which claims
    /// separately and skips signature verification (the stored payload was
    /// verified on first receipt).
    pub async fn process_claimed(
        &self,
        event_id: &str,
        event: &ProviderEvent,
        attempt: u32,
        actor: AuditActor,
        now: DateTime<Utc>,
    ) -> Result<Outcome, StoreError> {
        let details = match event {
            ProviderEvent::Unhandled { event_type } => {
                self.events.mark_processed(event_id, now).await?;
                self.audit(
                    AuditEntry::new(
                        actor,
                        format!("acknowledged unhandled event type '{event_type}'"),
                        now,
                    )
                    .with_event(event_id),
                )
                .await;
                info!(event_id, event_type, "unhandled event type acknowledged");
                return Ok(Outcome::Unhandled);
            }
            other => other
                .details()
                .expect("every handled event variant carries details"),
        };

        match self.apply_mutation(details, now).await {
            Ok(()) => {
                self.events.mark_processed(event_id, now).await?;
                self.audit(
                    AuditEntry::new(
                        actor,
                        format!(
                            "applied ledger mutation for {} (attempt {attempt})",
                            details.natural_key()
                        ),
                        now,
                    )
                    .with_event(event_id)
                    .with_subscription(&details.subscription_id),
                )
                .await;
                info!(
                    event_id,
                    natural_key = %details.natural_key(),
                    attempt,
                    "event processed"
                );
                Ok(Outcome::Accepted)
            }
            Err(e) => self.defer(event_id, details, attempt, actor, &e, now).await,
        }
    }

    /// Build the purchase row for a handled event and upsert it. The upsert
    /// is keyed on the natural key, so replays converge on the same row.
    async fn apply_mutation(
        &self,
        details: &SubscriptionDetails,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let record = PurchaseRecord {
            natural_key: details.natural_key(),
            subscription_id: details.subscription_id.clone(),
            status: details.status,
            amount_paid: details.amount_cents,
            purchase_type: details.purchase_type,
            source: PurchaseSource::Webhook,
            created_at: now,
            updated_at: now,
        };
        self.ledger.upsert_purchase(&record).await
    }

    async fn defer(
        &self,
        event_id: &str,
        details: &SubscriptionDetails,
        attempt: u32,
        actor: AuditActor,
        error: &LedgerError,
        now: DateTime<Utc>,
    ) -> Result<Outcome, StoreError> {
        let error_text = error.to_string();

        if self.policy.is_exhausted(attempt) {
            self.events
                .mark_abandoned(event_id, &error_text, now)
                .await?;
            self.audit(
                AuditEntry::new(
                    actor,
                    format!("abandoned after {attempt} attempts: {error_text}"),
                    now,
                )
                .with_event(event_id)
                .with_subscription(&details.subscription_id),
            )
            .await;
            warn!(event_id, attempt, error = %error_text, "event abandoned, attempt budget spent");
        } else {
            let next_retry_at = self.policy.next_retry_at(now, attempt);
            self.events
                .mark_failed(event_id, &error_text, next_retry_at, now)
                .await?;
            self.audit(
                AuditEntry::new(
                    actor,
                    format!("deferred attempt {attempt}, retry at {next_retry_at}: {error_text}"),
                    now,
                )
                .with_event(event_id)
                .with_subscription(&details.subscription_id),
            )
            .await;
            warn!(
                event_id,
                attempt,
                %next_retry_at,
                error = %error_text,
                "event deferred for retry"
            );
        }

        Ok(Outcome::Deferred { error: error_text })
    }

    /// Audit writes are best-effort: a failed audit insert must not turn a
    /// successfully processed event into an error.
    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.events.append_audit(&entry).await {
            warn!(error = %e, "failed to append audit entry");
        }
    }
}
