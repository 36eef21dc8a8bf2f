//! Position reconciliation engine - entry point.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

/// Position reconciliation engine
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via RECON_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before any TLS connection is made.
    recon_ws::init_crypto();

    let args = Args::parse();
    let config_path = recon_bot::AppConfig::resolve_path(args.config);
    let config = recon_bot::AppConfig::load(&config_path)?;

    recon_telemetry::init_logging(Some(&config.telemetry.log_level))?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = %config_path,
        assets = config.assets.len(),
        "Starting recon-bot"
    );

    let app = recon_bot::Application::new(config)?;
    if let Err(e) = app.run().await {
        error!(error = %e, "Application stopped on error");
        return Err(e.into());
    }
    Ok(())
}
