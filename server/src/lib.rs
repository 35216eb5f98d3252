pub mod auth;
pub mod barge;
pub mod codec;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod kb;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod ratelimit;
pub mod router;
pub mod session;
pub mod state;
pub mod textmatch;
pub mod turn;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{any, get};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::state::SharedGateway;

/// Build the gateway's HTTP/WS router.
pub fn build_router(gateway: SharedGateway) -> Router {
    let cors = if gateway.config.server.allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = gateway
            .config
            .server
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    };

    // Request timeout covers the sidecar; the WS upgrade response itself is
    // immediate, so long-lived sessions are unaffected.
    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(cors)
        .into_inner();

    Router::new()
        .route("/agent", any(session::agent_ws_handler))
        .route("/healthz", get(http::healthz))
        .route("/metrics", get(http::metrics))
        .route("/flag-status", get(http::flag_status))
        .route("/router/preview", get(http::router_preview))
        .route("/debug/connectivity", get(http::debug_connectivity))
        .layer(middleware_stack)
        .with_state(gateway)
}

/// Periodic housekeeping: expired conversations, stale cache entries and
/// idle pool entries.
pub fn spawn_sweeper(gateway: SharedGateway) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let evicted = gateway.memory.evict_expired().await;
            let purged = gateway.cache.purge_expired().await;
            let idle = gateway
                .pool
                .sweep_idle(gateway.config.server.idle_connection_ttl * 2);
            if evicted + purged + idle.len() > 0 {
                debug!(
                    conversations = evicted,
                    cache_entries = purged,
                    connections = idle.len(),
                    "sweeper pass"
                );
            }
        }
    });
}

/// Convenience constructor used by `main` and the integration tests.
pub fn build_gateway(config: config::Config) -> anyhow::Result<SharedGateway> {
    Ok(Arc::new(state::Gateway::from_config(config)?))
}
