mod app;
mod cli;
mod server;
mod telemetry;

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tracing::{error, info};

use crate::app::App;
use crate::cli::Args;
use crate::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    dotenv::dotenv().ok();

    let args = Args::parse();
    let config = args.load_config()?;

    init_telemetry(&config.telemetry)?;

    info!("Starting Flowrule server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        address = %config.server.address(),
        lanes = config.engine.dispatch_lanes,
        automation_principal = %config.engine.automation_principal,
        "Configuration loaded"
    );

    let app = App::build(config, Duration::from_secs(args.purge_interval_secs));
    let result = app.run().await;

    if let Err(ref e) = result {
        error!("Application error: {:#}", e);
    }

    info!("Server shutdown complete");

    result
}
