use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use paysync_server::admin::admin_router;
use paysync_server::config::Config;
use paysync_server::ingest::WebhookIngestor;
use paysync_server::provider::HttpProviderClient;
use paysync_server::reconcile::{reconcile_loop, ReconciliationEngine};
use paysync_server::retry::{retry_loop, RetryScheduler};
use paysync_server::store::SqliteStore;
use paysync_server::webhook::{webhook_router, HttpState};
use paysync_server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting payment sync service");

    let config = Config::from_env()?;

    let db_path = config.state_dir.join("paysync.db");
    info!("Using state database: {}", db_path.display());
    let store = Arc::new(SqliteStore::new(&db_path)?);

    let provider = Arc::new(HttpProviderClient::new(
        config.provider_api_base.clone(),
        config.provider_api_key.clone(),
    ));

    let app_state = Arc::new(AppState::new(
        config.clone(),
        store.clone(),
        store.clone(),
        provider.clone(),
    ));

    let ingestor = Arc::new(WebhookIngestor::new(
        config.webhook_secret.clone(),
        config.retry_policy(),
        store.clone(),
        store.clone(),
    ));
    let retry_scheduler = Arc::new(RetryScheduler::new(
        store.clone(),
        ingestor.clone(),
        config.retry_policy(),
    ));
    let reconciler = Arc::new(ReconciliationEngine::new(
        provider,
        store.clone(),
        store.clone(),
    ));

    let http_state = HttpState {
        app: app_state.clone(),
        ingestor,
        retry: retry_scheduler.clone(),
        reconciler: reconciler.clone(),
    };

    let app = Router::new()
        .merge(webhook_router())
        .merge(admin_router())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(http_state);

    tokio::spawn(retry_loop(app_state.clone(), retry_scheduler));
    tokio::spawn(reconcile_loop(app_state.clone(), reconciler));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    let shutdown = app_state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
