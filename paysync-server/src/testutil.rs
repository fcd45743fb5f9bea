//! Shared test doubles and fixtures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use paysync_core::{PurchaseType, RetryPolicy, SubscriptionStatus};

use crate::config::Config;
use crate::ingest::WebhookIngestor;
use crate::provider::{ProviderError, ProviderGateway, ProviderSubscription};
use crate::reconcile::ReconciliationEngine;
use crate::retry::RetryScheduler;
use crate::store::{InMemoryEventStore, InMemoryLedger};
use crate::webhook::HttpState;
use crate::AppState;

pub const TEST_SECRET: &str = "whsec_test";
pub const TEST_ADMIN_TOKEN: &str = "admin-token";

pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn test_config() -> Config {
    Config {
        webhook_secret: TEST_SECRET.to_string(),
        provider_api_base: "https://api.provider.example".to_string(),
        provider_api_key: None,
        port: 3000,
        state_dir: std::path::PathBuf::from("."),
        retry_interval_secs: 900,
        max_attempts: 3,
        backoff_base_secs: 300,
        backoff_cap_secs: 3600,
        reconcile_interval_secs: 21600,
        health_alert_threshold: 80,
        admin_auth_token: Some(TEST_ADMIN_TOKEN.to_string()),
    }
}

/// Fully wired in-memory HTTP state for handler tests.
pub fn http_state() -> HttpState {
    http_state_with_provider(Arc::new(FakeProvider::new(Vec::new())))
}

pub fn http_state_with_provider(provider: Arc<FakeProvider>) -> HttpState {
    let events = Arc::new(InMemoryEventStore::new());
    let ledger = Arc::new(InMemoryLedger::new());

    let app = Arc::new(AppState::new(
        test_config(),
        events.clone(),
        ledger.clone(),
        provider.clone(),
    ));
    let ingestor = Arc::new(WebhookIngestor::new(
        TEST_SECRET,
        RetryPolicy::default(),
        events.clone(),
        ledger.clone(),
    ));
    let retry = Arc::new(RetryScheduler::new(
        events.clone(),
        ingestor.clone(),
        RetryPolicy::default(),
    ));
    let reconciler = Arc::new(ReconciliationEngine::new(provider, ledger, events));

    HttpState {
        app,
        ingestor,
        retry,
        reconciler,
    }
}

pub fn provider_sub(id: &str, account: &str, product: &str) -> ProviderSubscription {
    ProviderSubscription {
        subscription_id: id.to_string(),
        account_id: account.to_string(),
        product_id: product.to_string(),
        amount_cents: 2999,
        status: SubscriptionStatus::Active,
        purchase_type: PurchaseType::Subscription,
    }
}

/// Scripted provider: returns a fixed subscription set, with optional
/// per-subscription failures to exercise error isolation.
#[derive(Default)]
pub struct FakeProvider {
    pub subscriptions: Mutex<Vec<ProviderSubscription>>,
    /// Subscription ids whose individual fetch should fail transiently.
    pub failing_ids: Mutex<Vec<String>>,
    /// When set, list_subscriptions fails outright.
    pub list_error: Mutex<Option<ProviderError>>,
    pub fetch_calls: Mutex<HashMap<String, u32>>,
}

impl FakeProvider {
    pub fn new(subscriptions: Vec<ProviderSubscription>) -> Self {
        FakeProvider {
            subscriptions: Mutex::new(subscriptions),
            ..Default::default()
        }
    }

    pub fn fail_fetch_of(&self, subscription_id: &str) {
        self.failing_ids
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
    }
}

#[async_trait]
impl ProviderGateway for FakeProvider {
    async fn list_subscriptions(&self) -> Result<Vec<ProviderSubscription>, ProviderError> {
        if let Some(err) = self.list_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.subscriptions.lock().unwrap().clone())
    }

    async fn fetch_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<ProviderSubscription>, ProviderError> {
        *self
            .fetch_calls
            .lock()
            .unwrap()
            .entry(subscription_id.to_string())
            .or_insert(0) += 1;

        if self
            .failing_ids
            .lock()
            .unwrap()
            .iter()
            .any(|id| id == subscription_id)
        {
            return Err(ProviderError::Http("connection reset".to_string()));
        }

        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.subscription_id == subscription_id)
            .cloned())
    }
}
