//! Retry scheduler for failed webhook events.
//!
//! Runs on a fixed interval (and on demand from the admin surface). Each run
//! selects failed events whose `next_retry_at` has passed and whose attempt
//! budget is not spent, oldest first, and re-applies the stored payload
//! through the ingestor's mutation step. No signature re-verification: the
//! payload was verified when first received.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use paysync_core::{parse_event, AuditActor, RetryPolicy};

use crate::ingest::{Outcome, WebhookIngestor};
use crate::store::{EventStore, StoreError};
use crate::AppState;

/// At most this many events are retried per run; the rest wait for the next
/// tick.
const RUN_BATCH_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub retried: u32,
    pub succeeded: u32,
    pub abandoned: u32,
}

pub struct RetryScheduler {
    events: Arc<dyn EventStore>,
    ingestor: Arc<WebhookIngestor>,
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(
        events: Arc<dyn EventStore>,
        ingestor: Arc<WebhookIngestor>,
        policy: RetryPolicy,
    ) -> Self {
        RetryScheduler {
            events,
            ingestor,
            policy,
        }
    }

    /// One scheduler tick. Each due event is retried at most once; per-event
    /// failures are recorded and never abort the run.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RetryReport, StoreError> {
        let due = self
            .events
            .due_retries(now, self.policy.max_attempts, RUN_BATCH_LIMIT)
            .await?;

        if due.is_empty() {
            return Ok(RetryReport::default());
        }

        info!(count = due.len(), "retrying due webhook events");
        let mut report = RetryReport::default();

        for event in due {
            // Conditional flip guards against a concurrent scheduler run or
            // a provider redelivery claiming the same event.
            match self.events.claim_retry(&event.event_id, now).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!(event_id = %event.event_id, error = %e, "failed to claim retry");
                    continue;
                }
            }

            let attempt = event.attempt_count + 1;
            report.retried += 1;

            let parsed = match parse_event(event.raw_payload.as_bytes()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    // The payload parsed when first received, so this is
                    // stored-data damage. Abandon rather than loop on it.
                    error!(event_id = %event.event_id, error = %e, "stored payload unparseable");
                    if let Err(e) = self
                        .events
                        .mark_abandoned(&event.event_id, &format!("stored payload: {e}"), now)
                        .await
                    {
                        error!(event_id = %event.event_id, error = %e, "failed to abandon event");
                    }
                    report.abandoned += 1;
                    continue;
                }
            };

            match self
                .ingestor
                .process_claimed(&event.event_id, &parsed.event, attempt, AuditActor::Retry, now)
                .await
            {
                Ok(Outcome::Accepted) | Ok(Outcome::Unhandled) => report.succeeded += 1,
                Ok(Outcome::Deferred { .. }) => {
                    if self.policy.is_exhausted(attempt) {
                        report.abandoned += 1;
                    }
                }
                Ok(other) => {
                    warn!(event_id = %event.event_id, ?other, "unexpected retry outcome");
                }
                Err(e) => {
                    error!(event_id = %event.event_id, error = %e, "retry bookkeeping failed");
                }
            }
        }

        info!(
            retried = report.retried,
            succeeded = report.succeeded,
            abandoned = report.abandoned,
            "retry run complete"
        );
        Ok(report)
    }
}

pub async fn retry_loop(state: Arc<AppState>, scheduler: Arc<RetryScheduler>) {
    let mut ticker = interval(Duration::from_secs(state.config.retry_interval_secs));
    // The first tick fires immediately, which drains any backlog left over
    // from before a restart.
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.shutdown.cancelled() => {
                info!("retry loop stopping");
                return;
            }
        }

        if let Err(e) = scheduler.run_once(Utc::now()).await {
            error!(error = %e, "retry run failed");
        }
    }
}
