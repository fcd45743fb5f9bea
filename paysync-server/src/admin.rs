//! Operator surface: event inspection, manual retry/reconciliation triggers,
//! health reporting, and a manual ledger escape hatch.
//!
//! Guarded by an optional bearer token. With no token configured the whole
//! surface is disabled rather than open.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use paysync_core::{
    health, AuditActor, AuditEntry, EventStatus, NaturalKey, PurchaseRecord, PurchaseSource,
    PurchaseType, SubscriptionStatus, WebhookEvent,
};

use crate::reconcile::{ReconciliationReport, Scope};
use crate::retry::RetryReport;
use crate::store::{EventStore, LedgerGateway};
use crate::webhook::HttpState;

const DEFAULT_EVENT_LIMIT: u32 = 50;
const MAX_EVENT_LIMIT: u32 = 500;
/// Window for counting failed/abandoned events in the health report.
const HEALTH_WINDOW_HOURS: i64 = 24;

/// Validate the authorization header against the admin auth token.
///
/// Returns `Ok(())` if authorized, or an error response if not.
#[allow(clippy::result_large_err)]
fn validate_auth(headers: &HeaderMap, auth_token: &Option<String>) -> Result<(), Response> {
    // If no auth token is configured, the surface is disabled outright.
    let Some(expected_token) = auth_token else {
        return Err((
            StatusCode::FORBIDDEN,
            "Admin API is disabled (ADMIN_AUTH_TOKEN not configured)",
        )
            .into_response());
    };

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth_header {
        Some(value) if value.starts_with("Bearer ") => {
            let provided_token = &value[7..];
            if provided_token == expected_token {
                Ok(())
            } else {
                Err((StatusCode::UNAUTHORIZED, "Invalid token").into_response())
            }
        }
        Some(_) => Err((
            StatusCode::UNAUTHORIZED,
            "Invalid Authorization header format. Expected: Bearer <token>",
        )
            .into_response()),
        None => Err((
            StatusCode::UNAUTHORIZED,
            "Missing Authorization header. Expected: Bearer <token>",
        )
            .into_response()),
    }
}

#[derive(Deserialize)]
pub struct EventsQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
}

pub async fn list_events(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<WebhookEvent>>, Response> {
    validate_auth(&headers, &state.app.config.admin_auth_token)?;

    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(EventStatus::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("unknown event status '{raw}'"),
            )
                .into_response()
        })?),
    };
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT);

    let events = state
        .app
        .events
        .recent_events(status, limit)
        .await
        .map_err(internal_error)?;

    Ok(Json(events))
}

pub async fn trigger_retry(
    State(state): State<HttpState>,
    headers: HeaderMap,
) -> Result<Json<RetryReport>, Response> {
    validate_auth(&headers, &state.app.config.admin_auth_token)?;

    info!("manual retry run requested");
    let report = state
        .retry
        .run_once(Utc::now())
        .await
        .map_err(internal_error)?;
    Ok(Json(report))
}

#[derive(Deserialize, Default)]
pub struct ReconcileRequest {
    pub subscription_id: Option<String>,
}

pub async fn trigger_reconcile(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: Option<Json<ReconcileRequest>>,
) -> Result<Json<ReconciliationReport>, Response> {
    validate_auth(&headers, &state.app.config.admin_auth_token)?;

    let scope = body
        .and_then(|Json(req)| req.subscription_id)
        .map(Scope::Subscription)
        .unwrap_or(Scope::All);

    info!(?scope, "manual reconciliation requested");
    let report = state
        .reconciler
        .reconcile(scope.clone(), &state.app.shutdown, Utc::now())
        .await;

    // Scoped runs see only one subscription; caching them would make the
    // health report lie about the whole ledger.
    if scope == Scope::All {
        *state.app.last_reconciliation.write().await = Some(report.clone());
    }

    Ok(Json(report))
}

#[derive(Serialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub report: health::HealthReport,
    pub needs_attention: bool,
    pub last_reconciliation_at: Option<chrono::DateTime<Utc>>,
}

pub async fn health_report(
    State(state): State<HttpState>,
    headers: HeaderMap,
) -> Result<Json<HealthResponse>, Response> {
    validate_auth(&headers, &state.app.config.admin_auth_token)?;

    let since = Utc::now() - Duration::hours(HEALTH_WINDOW_HOURS);
    let failed = state
        .app
        .events
        .count_unhealthy_since(since)
        .await
        .map_err(internal_error)?;

    let last = state.app.last_reconciliation.read().await.clone();
    let (missing, orphaned, last_run) = match &last {
        Some(report) => (
            report.missing_records(),
            report.orphaned_records(),
            Some(report.completed_at),
        ),
        None => (0, 0, None),
    };

    let report = health::score(failed, missing, orphaned);
    let needs_attention = report.needs_attention(state.app.config.health_alert_threshold);
    if needs_attention {
        warn!(
            score = report.score,
            failed, missing, orphaned, "health report needs attention"
        );
    }

    Ok(Json(HealthResponse {
        report,
        needs_attention,
        last_reconciliation_at: last_run,
    }))
}

#[derive(Deserialize)]
pub struct ManualPurchaseRequest {
    pub account_id: String,
    pub product_id: String,
    pub subscription_id: String,
    pub status: String,
    #[serde(default)]
    pub amount_paid: i64,
    pub purchase_type: Option<String>,
}

pub async fn insert_purchase(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(req): Json<ManualPurchaseRequest>,
) -> Result<(StatusCode, Json<PurchaseRecord>), Response> {
    validate_auth(&headers, &state.app.config.admin_auth_token)?;

    let status = SubscriptionStatus::parse(&req.status).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            format!("unknown subscription status '{}'", req.status),
        )
            .into_response()
    })?;
    let purchase_type = match req.purchase_type.as_deref() {
        None => PurchaseType::Subscription,
        Some(raw) => PurchaseType::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("unknown purchase type '{raw}'"),
            )
                .into_response()
        })?,
    };

    let now = Utc::now();
    let record = PurchaseRecord {
        natural_key: NaturalKey::derive(&req.account_id, &req.product_id),
        subscription_id: req.subscription_id.clone(),
        status,
        amount_paid: req.amount_paid,
        purchase_type,
        source: PurchaseSource::Manual,
        created_at: now,
        updated_at: now,
    };

    state
        .app
        .ledger
        .upsert_purchase(&record)
        .await
        .map_err(|e| {
            error!(error = %e, "manual purchase insert failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        })?;

    let entry = AuditEntry::new(
        AuditActor::Manual,
        format!("manual purchase upsert for {}", record.natural_key),
        now,
    )
    .with_subscription(&record.subscription_id);
    if let Err(e) = state.app.events.append_audit(&entry).await {
        warn!(error = %e, "failed to append audit entry for manual purchase");
    }

    info!(natural_key = %record.natural_key, "manual purchase recorded");
    Ok((StatusCode::CREATED, Json(record)))
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    error!(error = %e, "admin request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

pub fn admin_router() -> Router<HttpState> {
    Router::new()
        .route("/admin/events", get(list_events))
        .route("/admin/retry", post(trigger_retry))
        .route("/admin/reconcile", post(trigger_reconcile))
        .route("/admin/health", get(health_report))
        .route("/admin/purchases", post(insert_purchase))
}
