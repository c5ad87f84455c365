use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkiqError {
    #[error("failed to spawn workiq: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("request '{method}' timed out after {seconds}s")]
    Timeout { method: String, seconds: u64 },
    #[error("tool '{name}' not found; available tools: {available:?}")]
    ToolNotFound {
        name: String,
        available: Vec<String>,
    },
    #[error("workiq tool error: {0}")]
    Tool(String),
    #[error("workiq cli failed: {0}")]
    Cli(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("workiq connection closed")]
    Closed,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
