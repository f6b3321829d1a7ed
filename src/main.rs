use anyhow::Result;
use market_engine::api::{router, AppState};
use market_engine::cached_store::CachedStore;
use market_engine::config::Config;
use market_engine::hub::PriceFeedHub;
use market_engine::limiter::PositionLimiter;
use market_engine::memory_store::MemoryStore;
use market_engine::metrics;
use market_engine::pg_store::PgStore;
use market_engine::service::TradeService;
use market_engine::store::MarketStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("market_engine=info,tower_http=warn")),
        )
        .init();

    println!("🌦  Starting market engine...");

    let config = Config::from_env();
    let metrics_handle = metrics::install()?;

    let store: Arc<dyn MarketStore> = match &config.store.database_url {
        Some(url) => {
            tracing::info!(url = %mask_credentials(url), "connecting to PostgreSQL");
            let pg: Arc<dyn MarketStore> = Arc::new(PgStore::connect(url).await?);
            match &config.store.redis_url {
                Some(redis_url) => {
                    tracing::info!(url = %mask_credentials(redis_url), "attaching Redis read-through cache");
                    Arc::new(
                        CachedStore::connect(
                            pg,
                            redis_url,
                            Duration::from_secs(config.store.cache_ttl_secs),
                        )
                        .await?,
                    )
                }
                None => pg,
            }
        }
        None => {
            tracing::info!("DATABASE_URL not set, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let hub = PriceFeedHub::new();
    let limiter = PositionLimiter::new(
        config.limits.max_per_cell,
        config.limits.max_correlated,
        config.limits.cell_prefix_len,
    );
    let service = Arc::new(TradeService::new(
        store,
        limiter,
        Some(hub.clone()),
        config.limits.margin_limit,
    ));

    let app = router(AppState {
        service,
        hub,
        metrics: metrics_handle,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");

    // Graceful shutdown drains in-flight requests, but only for the
    // configured grace period.
    let shutdown_started = Arc::new(tokio::sync::Notify::new());
    let notify = Arc::clone(&shutdown_started);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        notify.notify_one();
    });

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    tokio::select! {
        result = server => result?,
        _ = async {
            shutdown_started.notified().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!("in-flight requests did not drain within grace period, exiting");
        }
    }

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

/// Hide the password portion of a connection URL in startup logs.
fn mask_credentials(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end + 3 => {
            let auth = &url[scheme_end + 3..at];
            match auth.find(':') {
                Some(colon) => format!(
                    "{}{}:***{}",
                    &url[..scheme_end + 3],
                    &auth[..colon],
                    &url[at..]
                ),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}
