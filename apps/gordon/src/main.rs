use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod app;
mod config;

#[derive(Parser)]
#[command(name = "gordon", about = "Self-hosted container deployment platform")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "GORDON_CONFIG", default_value = "gordon.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "gordon=info,tower_http=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    let cli = Cli::parse();
    app::run(cli.config).await
}
