use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "adsync", version)]
#[command(about = "Sync driver home addresses from HR into the fleet system")]
struct Cli {
    /// YAML configuration file with HR and fleet credentials.
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match adsync_sync::run_sync_from_config_file(&cli.config).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!(config = %cli.config.display(), "sync failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}
