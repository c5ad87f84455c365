use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;
use workiq_client::WorkiqConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config validation failed: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub default_model: Option<String>,
    pub endpoints: Vec<Endpoint>,
    /// Directory of the config file; script paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum HttpMethod {
    #[serde(rename = "GET", alias = "get")]
    Get,
    #[serde(rename = "POST", alias = "post")]
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Endpoint {
    pub name: String,
    pub description: String,
    pub path: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub ai_prompt: Option<AiPrompt>,
    #[serde(default)]
    pub script_handler: Option<ScriptHandler>,
    #[serde(default)]
    pub workiq_query: Option<WorkiqQuery>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AiPrompt {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptHandler {
    pub file: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkiqQuery {
    pub query: String,
}

pub fn load(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: ServiceConfig = serde_json::from_str(&raw)?;
    validate(&config)?;
    config.base_dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    info!(
        path = %path.display(),
        endpoints = config.endpoints.len(),
        "loaded config"
    );
    Ok(config)
}

fn validate(config: &ServiceConfig) -> Result<(), ConfigError> {
    if config.endpoints.is_empty() {
        return Err(ConfigError::Invalid(
            "config must declare at least one endpoint".to_string(),
        ));
    }
    let mut routes = HashSet::new();
    for (index, endpoint) in config.endpoints.iter().enumerate() {
        if endpoint.name.is_empty() || endpoint.description.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "endpoint at index {index} must have a non-empty name and description"
            )));
        }
        if !endpoint.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "endpoint '{}' path must start with '/'",
                endpoint.name
            )));
        }
        let kinds = [
            endpoint.ai_prompt.is_some(),
            endpoint.script_handler.is_some(),
            endpoint.workiq_query.is_some(),
        ];
        if kinds.iter().filter(|present| **present).count() != 1 {
            return Err(ConfigError::Invalid(format!(
                "endpoint at index {index} must specify exactly one of aiPrompt, scriptHandler, or workiqQuery"
            )));
        }
        if !routes.insert((endpoint.method, endpoint.path.clone())) {
            return Err(ConfigError::Invalid(format!(
                "duplicate route {} {}",
                endpoint.method, endpoint.path
            )));
        }
    }
    Ok(())
}

/// WorkIQ connection settings, overridable through the environment.
pub fn workiq_config_from_env() -> WorkiqConfig {
    let mut config = WorkiqConfig::default();
    if let Ok(binary) = std::env::var("WORKIQ_BINARY") {
        if !binary.is_empty() {
            config.binary = binary;
        }
    }
    if let Ok(dir) = std::env::var("WORKIQ_BIN_DIR") {
        config.bin_dir = if dir.is_empty() {
            None
        } else {
            Some(PathBuf::from(dir))
        };
    }
    if let Some(seconds) = env_u64("WORKIQ_REQUEST_TIMEOUT") {
        config.request_timeout = Duration::from_secs(seconds);
    }
    if let Some(seconds) = env_u64("WORKIQ_CLI_TIMEOUT") {
        config.cli_timeout = Duration::from_secs(seconds);
    }
    config
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
