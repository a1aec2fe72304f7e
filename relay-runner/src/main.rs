use anyhow::Result;
use relay_api::run as run_api;
use relay_core::Config;
use relay_core::RelayContext;
use tokio;
use tracing;
use tracing_subscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting push relay");

    let config = Config::from_env()?;
    tracing::info!(
        "Store backend: {:?}, push TTL {}s, {} deliveries in flight",
        config.database.backend,
        config.push.ttl_seconds,
        config.push.max_in_flight
    );

    let ctx = RelayContext::new(config).await?;
    tracing::info!("Relay context initialized");

    tokio::select! {
        result = run_api(ctx) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
