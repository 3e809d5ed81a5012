use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::delete, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use ad_serving_api::AppState;
use ad_serving_api::ad_service::AdService;
use ad_serving_api::config::AppConfig;
use ad_serving_api::db::AdDb;
use ad_serving_api::dispatcher::Dispatcher;
use ad_serving_api::expiry::{self, DeleteAdConsumer, InProcessTaskQueue, TaskQueue};
use ad_serving_api::handlers;
use ad_serving_api::lock::{DistributedLock, LocalLock};
use ad_serving_api::replication::{DEFAULT_LOG_MAX_LEN, InMemoryLog, ReplicationLog};
use ad_serving_api::store::InMemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("ad_serving_api=debug,tower_http=debug")
        }))
        .init();

    let config_path = std::env::var("AD_CONFIG").unwrap_or_else(|_| "./ad.toml".to_string());
    let config = AppConfig::load(&config_path)?;

    let db_path = std::env::var("AD_DB_PATH").unwrap_or_else(|_| config.database.path.clone());
    let db = Arc::new(AdDb::open(&db_path)?);
    tracing::info!("ad db opened at {db_path}");

    let store = Arc::new(InMemoryStore::new());
    let dispatcher = Dispatcher::spawn(store);
    let log: Arc<dyn ReplicationLog> = Arc::new(InMemoryLog::new(DEFAULT_LOG_MAX_LEN));
    let locker: Arc<dyn DistributedLock> = Arc::new(LocalLock::new());
    let tasks = Arc::new(InProcessTaskQueue::new());

    let ads = AdService::new(
        dispatcher,
        db,
        log,
        locker,
        tasks.clone() as Arc<dyn TaskQueue>,
        config.service.to_service_config(),
    );

    // Restore from the DB, then tail the replication stream.
    let run_handle = tokio::spawn({
        let ads = ads.clone();
        async move { ads.run().await }
    });

    // Deferred expiry: deletes each ad when its end time arrives.
    let expiry_handle = expiry::spawn_worker(
        tasks,
        Arc::new(DeleteAdConsumer { ads: ads.clone() }),
        Duration::from_millis(config.expiry.scan_interval_ms),
        ads.shutdown_signal(),
    );

    let state = AppState { ads: ads.clone() };
    let app = Router::new()
        .route(
            "/api/v1/ad",
            get(handlers::ads::get_ads).post(handlers::ads::create_ad),
        )
        .route("/api/v1/ad/{id}", delete(handlers::ads::delete_ad))
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("ad-serving-api listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = ads.shutdown(Duration::from_secs(10)).await {
        tracing::warn!("shutdown did not drain in time: {e}");
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), run_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), expiry_handle).await;
    tracing::info!("ad-serving-api stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("could not listen for shutdown signal: {e}");
        return;
    }
    tracing::info!("shutdown signal received");
}
