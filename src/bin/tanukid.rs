//! Main entry point for the tanuki-pool daemon.

use std::path::PathBuf;

use clap::Parser;

use tanuki_pool::{config::Config, daemon::Daemon, tracing};

#[derive(Parser)]
#[command(name = "tanukid", version, about = "Solo Bitcoin mining pool daemon")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    Daemon::new(config).run().await
}
