mod api;
mod bootstrap;
mod config;
mod error;
mod jobs;
mod ledger;
mod monitoring;
mod payments;
mod renewal;
mod server;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,subpay=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    info!("Starting subscription payment orchestrator");

    dotenv::dotenv().ok();
    let config = config::Config::from_env()?;

    let (state, mut scheduler) = bootstrap::initialize_app_state(&config).await?;
    let job_handles = scheduler.spawn_all();

    let app = server::create_app(state);

    let shutdown_scheduler = std::sync::Arc::new(scheduler);
    let shutdown_signal = {
        let scheduler = shutdown_scheduler.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            scheduler.shutdown();
        }
    };

    server::run_server(app, &config.bind_address, shutdown_signal).await?;

    for handle in job_handles {
        let _ = handle.await;
    }
    info!("Shutdown complete");

    Ok(())
}
