use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use cadence_core::config::CadenceConfig;
use cadence_scheduler::HttpActionExecutor;
use cadence_service::Service;

/// cadence - recurring job scheduler with missed-firing reconciliation
#[derive(Parser)]
#[command(name = "cadence-service")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_service=info,cadence_scheduler=info".into()),
        )
        .init();

    // explicit path > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let cli = Cli::parse();
    let config_path = cli.config.or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    let executor = Arc::new(HttpActionExecutor::new(&config.clients)?);
    let service = Service::start(&config, executor)?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    service.shutdown().await;
    Ok(())
}
