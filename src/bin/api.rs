use deposit_rate_assistant::{api::start_server, config::AppConfig, workflow::Orchestrator};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;

    info!("Deposit Rate Assistant - API Server");
    info!("Port: {}", config.port);

    let orchestrator = Arc::new(Orchestrator::from_config(&config).await?);

    // Expire stale confirmations and purge closed sessions
    let sweeper = orchestrator.clone();
    let sweep_interval = config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = sweeper.sweep().await {
                warn!("Session sweep failed: {}", e);
            }
        }
    });

    info!("Starting API server...");
    start_server(orchestrator, config.port).await?;

    Ok(())
}
