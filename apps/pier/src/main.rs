mod cli;
mod config;
mod engine;
mod prompt;
mod script;
mod server;

use clap::Parser;
use tracing::{error, info};

use crate::cli::{Cli, Commands};

const DEFAULT_PORT: u16 = 3000;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    if let Some(level) = &cli.log_level {
        std::env::set_var("RUST_LOG", level);
    } else if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();
    match cli.command {
        Commands::Start { config, port } => {
            let loaded = match config::load(&config) {
                Ok(loaded) => loaded,
                Err(err) => {
                    error!("failed to start: {err}");
                    std::process::exit(1);
                }
            };
            let port = port.or(loaded.port).unwrap_or(DEFAULT_PORT);
            if let Err(err) = server::run(loaded, port).await {
                error!("server error: {err:#}");
                std::process::exit(1);
            }
        }
        Commands::Check { config } => match config::load(&config) {
            Ok(loaded) => {
                info!(endpoints = loaded.endpoints.len(), "config ok");
            }
            Err(err) => {
                error!("invalid config: {err}");
                std::process::exit(1);
            }
        },
    }
}
