//! `lbsd` — the LibreSeed seeder daemon entrypoint.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use libreseed::{Config, Supervisor};

#[derive(Parser)]
#[command(name = "lbsd", about = "LibreSeed seeder daemon")]
struct Args {
    /// Path to a TOML config file. Defaults to LIBRESEED_CONFIG, then the
    /// platform config directory, then built-in defaults.
    #[arg(long, env = "LIBRESEED_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(data_dir = %config.data_dir.display(), listen_addr = %config.listen_addr, "starting lbsd");

    Supervisor::new(config).run().await?;
    Ok(())
}
