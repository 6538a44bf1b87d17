mod api;
mod bootstrap;
mod config;
mod error;
mod execution;
mod ledger;
mod middleware;
mod notifications;
mod relay;
mod risk;
mod server;
mod settlement;

#[cfg(test)]
mod testing;

use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,gasless_relayer=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env first so RUST_LOG from it applies
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting gasless relayer");

    let config = config::Config::from_env()?;
    let runtime = bootstrap::initialize_runtime(&config).await?;

    let app = server::create_app(runtime.state.clone(), &config);

    let shutdown = runtime.shutdown;
    let signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
        info!("🛑 Shutdown signal received");
        let _ = shutdown.send(true);
    };

    server::run_server(app, &config.bind_address, signal).await?;

    // Processors finish their in-flight attempt before stopping
    for task in runtime.tasks {
        match tokio::time::timeout(Duration::from_secs(90), task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Background task panicked: {}", e),
            Err(_) => warn!("Background task did not stop in time"),
        }
    }

    info!("✓ Gasless relayer stopped");
    Ok(())
}
