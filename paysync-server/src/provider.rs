//! HTTP client for the payment provider's REST API.
//!
//! Reconciliation is the only consumer: it lists the provider's
//! subscriptions and fetches individual ones when scoped to a single id.
//! Every call carries a request timeout; timeouts and 5xx responses are
//! transient and surface in the reconciliation report without aborting the
//! scan.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use paysync_core::{PurchaseType, SubscriptionStatus};

/// One subscription as the provider reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSubscription {
    pub subscription_id: String,
    pub account_id: String,
    pub product_id: String,
    pub amount_cents: i64,
    pub status: SubscriptionStatus,
    pub purchase_type: PurchaseType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Network-level failure or timeout.
    Http(String),
    /// Non-success HTTP status from the API.
    Api { status: u16, message: String },
    /// Response body did not match the expected shape.
    InvalidResponse(String),
}

impl ProviderError {
    /// Transient errors may succeed on the next pass; invalid responses
    /// will not.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(_) => true,
            ProviderError::Api { status, .. } => *status >= 500 || *status == 429,
            ProviderError::InvalidResponse(_) => false,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Http(msg) => write!(f, "provider request failed: {msg}"),
            ProviderError::Api { status, message } => {
                write!(f, "provider API returned {status}: {message}")
            }
            ProviderError::InvalidResponse(msg) => {
                write!(f, "provider response malformed: {msg}")
            }
        }
    }
}

impl std::error::Error for ProviderError {}

#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// All subscriptions the provider knows about, across pagination.
    async fn list_subscriptions(&self) -> Result<Vec<ProviderSubscription>, ProviderError>;

    /// A single subscription by the provider's id, or None if it does not
    /// exist there.
    async fn fetch_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<ProviderSubscription>, ProviderError>;
}

const REQUEST_TIMEOUT_SECS: u64 = 30;
const PAGE_SIZE: u32 = 100;

pub struct HttpProviderClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ApiSubscription {
    id: String,
    account: String,
    product: String,
    #[serde(default)]
    amount: i64,
    status: String,
    #[serde(default)]
    purchase_type: Option<String>,
}

#[derive(Deserialize)]
struct ApiListPage {
    data: Vec<ApiSubscription>,
    #[serde(default)]
    has_more: bool,
}

impl HttpProviderClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("reqwest client construction cannot fail with static options");

        HttpProviderClient {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.get(url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    fn convert(sub: ApiSubscription) -> Result<ProviderSubscription, ProviderError> {
        let status = SubscriptionStatus::parse(&sub.status).ok_or_else(|| {
            ProviderError::InvalidResponse(format!(
                "subscription {} has unknown status '{}'",
                sub.id, sub.status
            ))
        })?;

        let purchase_type = match sub.purchase_type.as_deref() {
            None => PurchaseType::Subscription,
            Some(raw) => PurchaseType::parse(raw).ok_or_else(|| {
                ProviderError::InvalidResponse(format!(
                    "subscription {} has unknown purchase_type '{raw}'",
                    sub.id
                ))
            })?,
        };

        Ok(ProviderSubscription {
            subscription_id: sub.id,
            account_id: sub.account,
            product_id: sub.product,
            amount_cents: sub.amount,
            status,
            purchase_type,
        })
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ProviderError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ProviderGateway for HttpProviderClient {
    async fn list_subscriptions(&self) -> Result<Vec<ProviderSubscription>, ProviderError> {
        let mut all = Vec::new();
        let mut starting_after: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/v1/subscriptions?limit={}",
                self.base_url, PAGE_SIZE
            );
            if let Some(cursor) = &starting_after {
                url.push_str(&format!("&starting_after={cursor}"));
            }

            let response = self
                .request(&url)
                .send()
                .await
                .map_err(|e| ProviderError::Http(e.to_string()))?;
            let response = Self::check_status(response).await?;

            let page: ApiListPage = response
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

            let last_id = page.data.last().map(|s| s.id.clone());
            for sub in page.data {
                all.push(Self::convert(sub)?);
            }

            if !page.has_more {
                break;
            }
            match last_id {
                Some(id) => starting_after = Some(id),
                None => {
                    warn!("provider reported has_more with an empty page, stopping pagination");
                    break;
                }
            }
        }

        Ok(all)
    }

    async fn fetch_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<ProviderSubscription>, ProviderError> {
        let url = format!("{}/v1/subscriptions/{subscription_id}", self.base_url);

        let response = self
            .request(&url)
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check_status(response).await?;

        let sub: ApiSubscription = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(Some(Self::convert(sub)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Http("timeout".to_string()).is_transient());
        assert!(ProviderError::Api {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(ProviderError::Api {
            status: 429,
            message: String::new()
        }
        .is_transient());
        assert!(!ProviderError::Api {
            status: 401,
            message: String::new()
        }
        .is_transient());
        assert!(!ProviderError::InvalidResponse("bad json".to_string()).is_transient());
    }

    #[test]
    fn converts_wire_subscription() {
        let sub = ApiSubscription {
            id: "sub_1".to_string(),
            account: "acct42".to_string(),
            product: "prod7".to_string(),
            amount: 2999,
            status: "active".to_string(),
            purchase_type: None,
        };
        let converted = HttpProviderClient::convert(sub).unwrap();
        assert_eq!(converted.subscription_id, "sub_1");
        assert_eq!(converted.status, SubscriptionStatus::Active);
        assert_eq!(converted.purchase_type, PurchaseType::Subscription);
    }

    #[test]
    fn rejects_unknown_status() {
        let sub = ApiSubscription {
            id: "sub_1".to_string(),
            account: "acct42".to_string(),
            product: "prod7".to_string(),
            amount: 0,
            status: "halfway".to_string(),
            purchase_type: None,
        };
        assert!(matches!(
            HttpProviderClient::convert(sub),
            Err(ProviderError::InvalidResponse(_))
        ));
    }
}
