//! Client for the WorkIQ assistant: a persistent JSON-RPC session over a
//! spawned `workiq` process, plus a one-shot CLI fallback for when the
//! session is unavailable.

mod error;
pub mod fallback;
mod rpc;
pub mod session;
mod transport;

use std::path::{Path, PathBuf};
use std::time::Duration;

pub use error::WorkiqError;
pub use session::{SessionState, WorkiqSession};

/// How to reach the WorkIQ installation on this machine.
#[derive(Clone, Debug)]
pub struct WorkiqConfig {
    /// Executable name, resolved against the augmented `PATH`.
    pub binary: String,
    /// Arguments that put the binary into persistent RPC mode.
    pub server_args: Vec<String>,
    /// Directory prepended to `PATH` when launching the binary.
    pub bin_dir: Option<PathBuf>,
    /// Client name reported during the `initialize` handshake.
    pub client_name: String,
    pub request_timeout: Duration,
    pub cli_timeout: Duration,
}

impl Default for WorkiqConfig {
    fn default() -> Self {
        Self {
            binary: "workiq".to_string(),
            server_args: vec!["mcp".to_string()],
            bin_dir: Some(default_bin_dir()),
            client_name: "pier".to_string(),
            request_timeout: Duration::from_secs(120),
            cli_timeout: Duration::from_secs(180),
        }
    }
}

pub fn default_bin_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    Path::new(&home).join(".workiq").join("bin")
}
