//! Reconciliation between the provider's subscription state and the
//! internal purchase ledger.
//!
//! The provider is authoritative for subscription status; the ledger is
//! authoritative for everything else (amount paid, purchase type,
//! provenance). Three findings are possible:
//!
//! - `missing_in_ledger`: the provider has a paying subscription we never
//!   recorded (lost webhook, abandoned event). Auto-fixed by inserting a row
//!   built from provider data, marked `source = reconciliation`.
//! - `status_mismatch`: both sides know the subscription but disagree on
//!   status. Auto-fixed with a status-only compare-and-set; internal fields
//!   are never touched.
//! - `orphaned_in_ledger`: the ledger says active but the provider has no
//!   such active subscription. Alerted only; deactivating a paid entitlement
//!   on inference would be guessing.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use paysync_core::{
    AuditActor, AuditEntry, Discrepancy, DiscrepancyKind, DiscrepancyResolution, NaturalKey,
    PurchaseRecord, PurchaseSource, SubscriptionStatus,
};

use crate::provider::{ProviderGateway, ProviderSubscription};
use crate::store::{EventStore, LedgerError, LedgerGateway};
use crate::AppState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Subscription(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub checked: u32,
    pub missing_fixed: u32,
    pub status_fixed: u32,
    pub orphaned: u32,
    pub errors: u32,
    /// True when the scan was stopped early by shutdown.
    pub cancelled: bool,
    pub discrepancies: Vec<Discrepancy>,
    pub completed_at: DateTime<Utc>,
}

impl ReconciliationReport {
    fn empty(now: DateTime<Utc>) -> Self {
        ReconciliationReport {
            checked: 0,
            missing_fixed: 0,
            status_fixed: 0,
            orphaned: 0,
            errors: 0,
            cancelled: false,
            discrepancies: Vec::new(),
            completed_at: now,
        }
    }

    pub fn missing_records(&self) -> u64 {
        self.discrepancies
            .iter()
            .filter(|d| d.kind == DiscrepancyKind::MissingInLedger)
            .count() as u64
    }

    pub fn orphaned_records(&self) -> u64 {
        u64::from(self.orphaned)
    }
}

pub struct ReconciliationEngine {
    provider: Arc<dyn ProviderGateway>,
    ledger: Arc<dyn LedgerGateway>,
    events: Arc<dyn EventStore>,
}

impl ReconciliationEngine {
    pub fn new(
        provider: Arc<dyn ProviderGateway>,
        ledger: Arc<dyn LedgerGateway>,
        events: Arc<dyn EventStore>,
    ) -> Self {
        ReconciliationEngine {
            provider,
            ledger,
            events,
        }
    }

    /// Run one reconciliation pass. Per-item failures are counted and the
    /// scan continues; the cancellation token is checked between items, so
    /// shutdown never leaves a subscription half-processed.
    pub async fn reconcile(
        &self,
        scope: Scope,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> ReconciliationReport {
        let mut report = ReconciliationReport::empty(now);

        let provider_subs = match self.subscriptions_in_scope(&scope).await {
            Ok(subs) => subs,
            Err(e) => {
                if e.is_transient() {
                    warn!(error = %e, "provider unavailable, skipping reconciliation pass");
                } else {
                    error!(error = %e, "provider query failed, skipping reconciliation pass");
                }
                report.errors += 1;
                return report;
            }
        };

        // Forward pass: every paying provider subscription must have a
        // ledger row with a matching status.
        for sub in &provider_subs {
            if cancel.is_cancelled() {
                report.cancelled = true;
                report.completed_at = Utc::now();
                warn!("reconciliation cancelled mid-scan");
                return report;
            }

            if !matches!(
                sub.status,
                SubscriptionStatus::Active | SubscriptionStatus::PastDue
            ) {
                continue;
            }

            report.checked += 1;
            if let Err(e) = self.check_subscription(sub, &mut report, now).await {
                warn!(
                    subscription_id = %sub.subscription_id,
                    error = %e,
                    "reconciliation of one subscription failed"
                );
                report.errors += 1;
            }
        }

        // Orphan pass: active ledger rows whose subscription the provider
        // no longer reports as paying.
        let provider_active: HashSet<&str> = provider_subs
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    SubscriptionStatus::Active | SubscriptionStatus::PastDue
                )
            })
            .map(|s| s.subscription_id.as_str())
            .collect();

        match self.ledger.active_purchases().await {
            Ok(rows) => {
                for row in rows {
                    if cancel.is_cancelled() {
                        report.cancelled = true;
                        break;
                    }
                    if let Scope::Subscription(id) = &scope {
                        if &row.subscription_id != id {
                            continue;
                        }
                    }
                    if !provider_active.contains(row.subscription_id.as_str()) {
                        self.record_orphan(&row, &mut report, now).await;
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "failed to list active purchases for orphan pass");
                report.errors += 1;
            }
        }

        report.completed_at = Utc::now();
        info!(
            checked = report.checked,
            missing_fixed = report.missing_fixed,
            status_fixed = report.status_fixed,
            orphaned = report.orphaned,
            errors = report.errors,
            cancelled = report.cancelled,
            "reconciliation pass complete"
        );
        report
    }

    async fn subscriptions_in_scope(
        &self,
        scope: &Scope,
    ) -> Result<Vec<ProviderSubscription>, crate::provider::ProviderError> {
        match scope {
            Scope::All => self.provider.list_subscriptions().await,
            Scope::Subscription(id) => {
                Ok(self.provider.fetch_subscription(id).await?.into_iter().collect())
            }
        }
    }

    async fn check_subscription(
        &self,
        sub: &ProviderSubscription,
        report: &mut ReconciliationReport,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let key = NaturalKey::derive(&sub.account_id, &sub.product_id);

        let existing = self.ledger.find_by_natural_key(&key).await?;

        let Some(existing) = existing else {
            let record = PurchaseRecord {
                natural_key: key.clone(),
                subscription_id: sub.subscription_id.clone(),
                status: sub.status,
                amount_paid: sub.amount_cents,
                purchase_type: sub.purchase_type,
                source: PurchaseSource::Reconciliation,
                created_at: now,
                updated_at: now,
            };

            // insert_if_absent so a webhook landing between our read and
            // this write wins; we never clobber a fresher row.
            if self.ledger.insert_if_absent(&record).await? {
                report.missing_fixed += 1;
                self.record_finding(
                    report,
                    &sub.subscription_id,
                    DiscrepancyKind::MissingInLedger,
                    DiscrepancyResolution::AutoFixed,
                    format!("inserted missing ledger row for {key}"),
                    now,
                )
                .await;
            }
            return Ok(());
        };

        if existing.status != sub.status {
            // Provider is authoritative for status. Compare-and-set on
            // updated_at: a concurrent webhook write makes this a Conflict,
            // and the next pass re-reads.
            self.ledger
                .update_status(&key, sub.status, existing.updated_at, now)
                .await?;
            report.status_fixed += 1;
            self.record_finding(
                report,
                &sub.subscription_id,
                DiscrepancyKind::StatusMismatch,
                DiscrepancyResolution::AutoFixed,
                format!(
                    "status for {key} corrected from {} to {}",
                    existing.status.as_str(),
                    sub.status.as_str()
                ),
                now,
            )
            .await;
        }

        Ok(())
    }

    async fn record_orphan(
        &self,
        row: &PurchaseRecord,
        report: &mut ReconciliationReport,
        now: DateTime<Utc>,
    ) {
        report.orphaned += 1;
        warn!(
            subscription_id = %row.subscription_id,
            natural_key = %row.natural_key,
            "ledger row active but provider reports no paying subscription"
        );
        self.record_finding(
            report,
            &row.subscription_id,
            DiscrepancyKind::OrphanedInLedger,
            DiscrepancyResolution::Alerted,
            format!(
                "active ledger row {} has no paying provider subscription",
                row.natural_key
            ),
            now,
        )
        .await;
    }

    async fn record_finding(
        &self,
        report: &mut ReconciliationReport,
        subscription_id: &str,
        kind: DiscrepancyKind,
        resolution: DiscrepancyResolution,
        detail: String,
        now: DateTime<Utc>,
    ) {
        report.discrepancies.push(Discrepancy {
            subscription_id: subscription_id.to_string(),
            kind,
            resolution,
            detected_at: now,
        });

        let entry = AuditEntry::new(AuditActor::Reconciliation, detail, now)
            .with_subscription(subscription_id);
        if let Err(e) = self.events.append_audit(&entry).await {
            warn!(error = %e, "failed to append reconciliation audit entry");
        }
    }
}

pub async fn reconcile_loop(state: Arc<AppState>, engine: Arc<ReconciliationEngine>) {
    let mut ticker = interval(Duration::from_secs(state.config.reconcile_interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.shutdown.cancelled() => {
                info!("reconciliation loop stopping");
                return;
            }
        }

        let report = engine
            .reconcile(Scope::All, &state.shutdown, Utc::now())
            .await;
        *state.last_reconciliation.write().await = Some(report);
    }
}
