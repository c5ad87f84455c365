use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "pier")]
#[command(about = "Serve declarative REST endpoints backed by AI prompts, scripts, or WorkIQ")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level filter (overrides RUST_LOG), e.g. debug or pier=trace
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the endpoint server from a JSON config
    Start {
        /// Path to the JSON configuration file
        #[arg(short, long, default_value = "pier.json")]
        config: PathBuf,

        /// Port to bind on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Validate a configuration file without starting the server
    Check {
        /// Path to the JSON configuration file
        #[arg(short, long, default_value = "pier.json")]
        config: PathBuf,
    },
}
