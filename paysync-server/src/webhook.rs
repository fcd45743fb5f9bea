//! Inbound webhook endpoint.
//!
//! One route: `POST /webhook` with the raw payload and the provider's
//! signature header. Everything authenticated and well-formed is
//! acknowledged with a 200, including deliveries whose ledger effect failed
//! transiently: the provider cannot act on application-level outcomes, and a
//! non-200 only triggers a redelivery storm. The retry scheduler and
//! reconciliation own recovery.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use crate::ingest::{Outcome, RejectReason, WebhookIngestor};
use crate::reconcile::ReconciliationEngine;
use crate::retry::RetryScheduler;
use crate::signature::SIGNATURE_HEADER;
use crate::AppState;

/// Everything the HTTP handlers need. Cloning is cheap; all fields are
/// shared handles.
#[derive(Clone)]
pub struct HttpState {
    pub app: Arc<AppState>,
    pub ingestor: Arc<WebhookIngestor>,
    pub retry: Arc<RetryScheduler>,
    pub reconciler: Arc<ReconciliationEngine>,
}

#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

impl WebhookResponse {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(WebhookResponse {
            message: message.into(),
        })
    }
}

/// Tag every delivery with a correlation id so all log lines for one
/// delivery can be tied together.
async fn with_correlation_id(mut request: Request, next: Next) -> Response {
    let correlation_id = CorrelationId(Uuid::new_v4().to_string());
    let span = tracing::info_span!("delivery", correlation_id = %correlation_id.0);
    request.extensions_mut().insert(correlation_id);
    next.run(request).instrument(span).await
}

pub async fn provider_webhook_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), StatusCode> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok());

    let outcome = state.ingestor.handle(&body, signature).await.map_err(|e| {
        error!(error = %e, "webhook processing hit a storage failure");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let response = match outcome {
        Outcome::Accepted => (StatusCode::OK, WebhookResponse::new("processed")),
        Outcome::AlreadyProcessed => (StatusCode::OK, WebhookResponse::new("already processed")),
        Outcome::Unhandled => (StatusCode::OK, WebhookResponse::new("ignored")),
        // Acknowledged so the provider stops redelivering; the retry
        // scheduler owns this event now.
        Outcome::Deferred { .. } => (StatusCode::OK, WebhookResponse::new("accepted")),
        Outcome::Rejected(RejectReason::AuthError) => (
            StatusCode::BAD_REQUEST,
            WebhookResponse::new("invalid signature"),
        ),
        Outcome::Rejected(RejectReason::MalformedPayload) => (
            StatusCode::BAD_REQUEST,
            WebhookResponse::new("malformed payload"),
        ),
    };

    info!(status = %response.0, message = %response.1.message, "webhook delivery handled");
    Ok(response)
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "paysync"
    }))
}

pub fn webhook_router() -> Router<HttpState> {
    Router::new()
        .route("/webhook", post(provider_webhook_handler))
        .route_layer(middleware::from_fn(with_correlation_id))
        .route("/health", get(health_check))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::ServiceExt;

    use crate::signature::sign_payload;
    use crate::testutil::{http_state, TEST_SECRET as SECRET};

    fn app() -> Router {
        webhook_router().with_state(http_state())
    }

    fn event_payload() -> Vec<u8> {
        serde_json::json!({
            "id": "evt_1",
            "type": "subscription.created",
            "data": {
                "object": {
                    "id": "sub_1",
                    "account": "acct42",
                    "product": "prod7",
                    "amount": 2999,
                    "status": "active",
                }
            }
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn signed_delivery_returns_200() {
        let payload = event_payload();
        let sig = sign_payload(SECRET, &payload);

        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header(SIGNATURE_HEADER, sig)
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bad_signature_returns_400() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header(SIGNATURE_HEADER, "sha256=deadbeef")
                    .body(Body::from(event_payload()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_signature_returns_400() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .body(Body::from(event_payload()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_endpoint_is_open() {
        let response = app()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
