use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;

use server::config::Config;
use server::{build_gateway, build_router, spawn_sweeper};

fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file before reading LOG_LEVEL.
    dotenv::dotenv().ok();

    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    // Create tokio runtime
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    info!("Starting voice agent gateway...");

    let config = Config::from_env();
    config.validate()?;

    let gateway = build_gateway(config)?;
    info!(
        stt = gateway.registry.stts.len(),
        llm = gateway.registry.llms.len(),
        tts = gateway.registry.ttss.len(),
        "providers configured"
    );

    spawn_sweeper(gateway.clone());

    let port = gateway.config.server.port;
    let app = build_router(gateway);

    let addr: SocketAddr = format!("0.0.0.0:{}", port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Failed to parse address: {}", e))?;

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to bind to {}: {}. Try a different port by setting PORT environment variable.",
            addr,
            e
        )
    })?;

    info!("Gateway listening on http://{} (ws path /agent)", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
