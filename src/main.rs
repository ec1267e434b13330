mod config;
mod handlers;

use std::net::SocketAddr;

use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chart_relay::{KvStore, MemoryKv, RelayService};
use chart_relay_redis::RedisKv;

use crate::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    tracing::info!(
        port = config.port,
        redis = ?config.redis_url,
        heartbeat_secs = config.heartbeat.as_secs(),
        "Relay starting"
    );

    match config.redis_url.clone() {
        Some(url) => {
            let store = RedisKv::new();
            // A failed connect degrades to in-memory-only delivery; the
            // relay logs storage failures and keeps serving
            if let Err(e) = store.connect(&url).await {
                tracing::warn!(error = %e, "Redis connect failed - durability degraded");
            }
            serve(RelayService::new(store, config.relay_config()), &config).await
        }
        None => {
            tracing::info!("REDIS_URL not set - using in-memory storage");
            serve(
                RelayService::new(MemoryKv::new(), config.relay_config()),
                &config,
            )
            .await
        }
    }
}

async fn serve<S: KvStore>(relay: RelayService<S>, config: &AppConfig) -> anyhow::Result<()> {
    let app = handlers::router(relay)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Relay shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=info,chart_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
