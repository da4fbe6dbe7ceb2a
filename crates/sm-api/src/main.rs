use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sm_api::config::AppConfig;
use sm_api::service::ServerService;
use sm_api::state::AppState;
use sm_api::{billing, metrics, reaper, routes};
use sm_db::{PgStore, Store};

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = AppConfig::from_env();

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    metrics::init_metrics();

    // Database
    let pool = sm_db::create_pool(&config.database_url())
        .await
        .expect("failed to connect to database");

    sm_db::run_migrations(&pool)
        .await
        .expect("failed to run migrations");

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    match sm_db::seed_ip_pool(store.as_ref(), &config.ip_cidr).await {
        Ok(_) => {
            let (total, free) = store.count_ips().await.expect("failed to count IP pool");
            tracing::info!(total, free, "IP pool ready");
        }
        Err(err) => tracing::error!(error = %err, "failed to seed IP pool"),
    }

    let service = Arc::new(ServerService::new(store.clone()));

    // Background loops share one shutdown token and exit at their next tick.
    let shutdown = CancellationToken::new();
    billing::spawn(store.clone(), &config, shutdown.clone());
    if config.enable_idle_reaper {
        reaper::spawn(store.clone(), service.clone(), &config, shutdown.clone());
    } else {
        tracing::info!("idle reaper disabled");
    }

    tokio::spawn(shutdown_signal(shutdown.clone()));

    // Standalone metrics listener for scrapers.
    let metrics_app = Router::new().route("/metrics", get(routes::metrics_text));
    let metrics_listener =
        tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.metrics_port))
            .await
            .expect("failed to bind metrics listener");
    tracing::info!(port = config.metrics_port, "metrics listener ready");
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(metrics_listener, metrics_app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(err) = result {
                tracing::error!(error = %err, "metrics server error");
            }
        });
    }

    let state = AppState {
        service,
        config: config.clone(),
    };
    let app = routes::api_router(state);

    let listener = tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.http_port))
        .await
        .expect("failed to bind listener");

    tracing::info!(port = config.http_port, env = %config.env, "starting control plane API");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .expect("server error");

    tracing::info!("shutdown complete");
}

/// Cancel the shutdown token on SIGINT or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::warn!("received shutdown signal, shutting down");
    shutdown.cancel();
}
