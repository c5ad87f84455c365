use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::WorkiqError;
use crate::rpc::RpcSession;
use crate::transport::ProcessTransport;
use crate::WorkiqConfig;

const SESSION_TARGET: &str = "workiq::session";

/// Protocol revision sent during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Remote operation that answers natural-language queries.
const QUERY_TOOL: &str = "ask_workiq";
/// Remote operation that records one-time consent, when the server offers it.
const CONSENT_TOOL: &str = "accept_terms";
/// Argument key used when the query tool does not declare its input shape.
const DEFAULT_QUERY_KEY: &str = "query";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Option<Value>,
}

struct Connection {
    rpc: Arc<RpcSession>,
    catalog: Vec<ToolDescriptor>,
}

/// One persistent workiq session per host process. The connection is
/// established lazily on first use and re-established after the process
/// exits; the whole handshake runs behind a single guard so concurrent
/// callers cannot race two handshakes against one subprocess.
pub struct WorkiqSession {
    config: WorkiqConfig,
    state: StdMutex<SessionState>,
    conn: Mutex<Option<Connection>>,
}

impl WorkiqSession {
    pub fn new(config: WorkiqConfig) -> Self {
        Self {
            config,
            state: StdMutex::new(SessionState::Disconnected),
            conn: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: SessionState) {
        let mut guard = self.state.lock().unwrap();
        if *guard != next {
            debug!(target: SESSION_TARGET, from = ?*guard, to = ?next, "session state change");
            *guard = next;
        }
    }

    /// Establishes the session if it is not already `Ready`.
    pub async fn connect(&self) -> Result<(), WorkiqError> {
        self.ensure_ready().await.map(|_| ())
    }

    /// Sends one query over the persistent session, connecting first when
    /// needed. Connection-level failures reset the session so the next call
    /// reconnects.
    pub async fn ask(&self, query: &str) -> Result<String, WorkiqError> {
        let (rpc, catalog) = self.ensure_ready().await?;
        match ask_over(&rpc, &catalog, query).await {
            Ok(text) => Ok(text),
            Err(err) => {
                if matches!(err, WorkiqError::Closed | WorkiqError::Io(_)) {
                    self.reset().await;
                }
                Err(err)
            }
        }
    }

    /// Terminates the subprocess. The session can be re-established by a
    /// later call to `ask` or `connect`.
    pub async fn shutdown(&self) {
        self.reset().await;
    }

    async fn reset(&self) {
        let mut conn = self.conn.lock().await;
        if let Some(connection) = conn.take() {
            connection.rpc.shutdown().await;
        }
        self.set_state(SessionState::Disconnected);
    }

    async fn ensure_ready(
        &self,
    ) -> Result<(Arc<RpcSession>, Vec<ToolDescriptor>), WorkiqError> {
        let mut conn = self.conn.lock().await;
        match conn.as_ref() {
            Some(connection) if !connection.rpc.is_closed() => {
                return Ok((Arc::clone(&connection.rpc), connection.catalog.clone()));
            }
            Some(_) => {
                debug!(target: SESSION_TARGET, "workiq process exited; reconnecting");
                if let Some(stale) = conn.take() {
                    stale.rpc.shutdown().await;
                }
                self.set_state(SessionState::Disconnected);
            }
            None => {}
        }

        self.set_state(SessionState::Connecting);
        let (transport, incoming) = match ProcessTransport::spawn(&self.config).await {
            Ok(pair) => pair,
            Err(err) => {
                self.set_state(SessionState::Disconnected);
                return Err(err);
            }
        };
        let rpc = Arc::new(RpcSession::new(
            transport,
            incoming,
            self.config.request_timeout,
        ));

        self.set_state(SessionState::Handshaking);
        let catalog = match handshake(&rpc, &self.config).await {
            Ok(catalog) => catalog,
            Err(err) => {
                rpc.shutdown().await;
                self.set_state(SessionState::Disconnected);
                return Err(err);
            }
        };

        info!(
            target: SESSION_TARGET,
            tools = catalog.len(),
            "workiq session ready"
        );
        self.set_state(SessionState::Ready);
        let pair = (Arc::clone(&rpc), catalog.clone());
        *conn = Some(Connection { rpc, catalog });
        Ok(pair)
    }
}

/// Runs the fixed initialization sequence: `initialize`, the `initialized`
/// notification, `tools/list`, and the one-time consent call when the server
/// offers it. Queries are only accepted once this completes.
async fn handshake(
    rpc: &RpcSession,
    config: &WorkiqConfig,
) -> Result<Vec<ToolDescriptor>, WorkiqError> {
    rpc.request(
        "initialize",
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": config.client_name,
                "version": env!("CARGO_PKG_VERSION"),
            },
        }),
    )
    .await?;

    rpc.notify("notifications/initialized", json!({})).await?;

    let listed = rpc.request("tools/list", json!({})).await?;
    let catalog: Vec<ToolDescriptor> = listed
        .get("tools")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();

    if catalog.iter().any(|tool| tool.name == CONSENT_TOOL) {
        let consent = rpc
            .request(
                "tools/call",
                json!({"name": CONSENT_TOOL, "arguments": {"accept": true}}),
            )
            .await;
        if let Err(err) = consent {
            // The remote side may already have consent on record.
            warn!(target: SESSION_TARGET, error = %err, "consent call failed; continuing");
        }
    }

    Ok(catalog)
}

async fn ask_over(
    rpc: &RpcSession,
    catalog: &[ToolDescriptor],
    query: &str,
) -> Result<String, WorkiqError> {
    let tool = catalog
        .iter()
        .find(|tool| tool.name == QUERY_TOOL)
        .ok_or_else(|| WorkiqError::ToolNotFound {
            name: QUERY_TOOL.to_string(),
            available: catalog.iter().map(|tool| tool.name.clone()).collect(),
        })?;

    let key = argument_key(tool);
    let result = rpc
        .request(
            "tools/call",
            json!({"name": tool.name, "arguments": {(key): query}}),
        )
        .await?;
    extract_text(&result)
}

/// First declared property of the tool's input shape, falling back to the
/// fixed default key. Relies on the catalog preserving declaration order; a
/// server that reorders its schema changes which key we pick.
fn argument_key(tool: &ToolDescriptor) -> String {
    tool.input_schema
        .as_ref()
        .and_then(|schema| schema.get("properties"))
        .and_then(Value::as_object)
        .and_then(|properties| properties.keys().next())
        .cloned()
        .unwrap_or_else(|| DEFAULT_QUERY_KEY.to_string())
}

fn extract_text(result: &Value) -> Result<String, WorkiqError> {
    let text = first_text_item(result);
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if is_error {
        return Err(WorkiqError::Tool(
            text.unwrap_or_else(|| "tool reported an error".to_string()),
        ));
    }
    Ok(text.unwrap_or_else(|| result.to_string()))
}

fn first_text_item(result: &Value) -> Option<String> {
    result
        .get("content")
        .and_then(Value::as_array)?
        .iter()
        .find(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        .and_then(|item| item.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
