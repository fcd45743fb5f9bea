use anyhow::{Context, Result};
use chrono::Duration;
use paysync_core::RetryPolicy;
use std::env;
use std::path::PathBuf;

#[derive(Clone)]
pub struct Config {
    /// Shared secret for verifying provider webhook signatures.
    pub webhook_secret: String,
    /// Base URL of the provider's REST API.
    pub provider_api_base: String,
    /// API key sent as a bearer token to the provider.
    pub provider_api_key: Option<String>,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// How often the retry scheduler wakes up.
    pub retry_interval_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_secs: i64,
    pub backoff_cap_secs: i64,
    /// How often the reconciliation loop runs.
    pub reconcile_interval_secs: u64,
    /// Health scores below this are flagged for attention.
    pub health_alert_threshold: u8,
    /// Optional bearer token for the /admin endpoints.
    /// If not set, the admin surface is disabled (returns 403 Forbidden).
    pub admin_auth_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let webhook_secret = env::var("PROVIDER_WEBHOOK_SECRET")
            .context("PROVIDER_WEBHOOK_SECRET environment variable is required")?;

        let provider_api_base = env::var("PROVIDER_API_BASE")
            .unwrap_or_else(|_| "https://api.provider.example".to_string());

        let provider_api_key = env::var("PROVIDER_API_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let retry_interval_secs = env::var("RETRY_INTERVAL_SECS")
            .unwrap_or_else(|_| "900".to_string())
            .parse::<u64>()
            .context("RETRY_INTERVAL_SECS must be a valid number")?;

        let max_attempts = env::var("MAX_ATTEMPTS")
            .unwrap_or_else(|_| "3".to_string())
            .parse::<u32>()
            .context("MAX_ATTEMPTS must be a valid number")?;

        let backoff_base_secs = env::var("BACKOFF_BASE_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<i64>()
            .context("BACKOFF_BASE_SECS must be a valid number")?;

        let backoff_cap_secs = env::var("BACKOFF_CAP_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse::<i64>()
            .context("BACKOFF_CAP_SECS must be a valid number")?;

        let reconcile_interval_secs = env::var("RECONCILE_INTERVAL_SECS")
            .unwrap_or_else(|_| "21600".to_string())
            .parse::<u64>()
            .context("RECONCILE_INTERVAL_SECS must be a valid number")?;

        let health_alert_threshold = env::var("HEALTH_ALERT_THRESHOLD")
            .unwrap_or_else(|_| "80".to_string())
            .parse::<u8>()
            .context("HEALTH_ALERT_THRESHOLD must be a valid number")?;

        let admin_auth_token = parse_admin_auth_token(env::var("ADMIN_AUTH_TOKEN").ok());

        Ok(Config {
            webhook_secret,
            provider_api_base,
            provider_api_key,
            port,
            state_dir,
            retry_interval_secs,
            max_attempts,
            backoff_base_secs,
            backoff_cap_secs,
            reconcile_interval_secs,
            health_alert_threshold,
            admin_auth_token,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::seconds(self.backoff_base_secs),
            Duration::seconds(self.backoff_cap_secs),
        )
    }
}

/// Parse ADMIN_AUTH_TOKEN from an optional string value.
///
/// Returns None if the value is missing, empty, or contains only whitespace.
/// An empty token must not grant unauthenticated access to the admin surface.
pub fn parse_admin_auth_token(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            webhook_secret: "whsec_test".to_string(),
            provider_api_base: "https://api.provider.example".to_string(),
            provider_api_key: None,
            port: 3000,
            state_dir: PathBuf::from("."),
            retry_interval_secs: 900,
            max_attempts: 3,
            backoff_base_secs: 300,
            backoff_cap_secs: 3600,
            reconcile_interval_secs: 21600,
            health_alert_threshold: 80,
            admin_auth_token: None,
        }
    }

    #[test]
    fn test_parse_admin_auth_token_none() {
        assert_eq!(parse_admin_auth_token(None), None);
    }

    #[test]
    fn test_parse_admin_auth_token_empty_string() {
        // Empty string should be treated as unset (None)
        assert_eq!(parse_admin_auth_token(Some("".to_string())), None);
    }

    #[test]
    fn test_parse_admin_auth_token_whitespace_only() {
        assert_eq!(parse_admin_auth_token(Some("   ".to_string())), None);
        assert_eq!(parse_admin_auth_token(Some("\t\n".to_string())), None);
    }

    #[test]
    fn test_parse_admin_auth_token_valid() {
        assert_eq!(
            parse_admin_auth_token(Some("secret-token".to_string())),
            Some("secret-token".to_string())
        );
    }

    #[test]
    fn retry_policy_uses_configured_schedule() {
        let policy = test_config().retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(1).num_minutes(), 5);
        assert_eq!(policy.delay_for(2).num_minutes(), 10);
        assert_eq!(policy.delay_for(3).num_minutes(), 20);
        assert_eq!(policy.delay_for(10).num_minutes(), 60);
    }
}
