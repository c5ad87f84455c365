use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;
use workiq_client::{fallback, WorkiqConfig, WorkiqSession};

use crate::config::{Endpoint, HttpMethod, ServiceConfig};
use crate::prompt::PromptHandler;
use crate::script::ScriptRunner;

const ENGINE_TARGET: &str = "pier::engine";

/// Shared clients handed to every handler at build time. One workiq session
/// serves the whole process; handler factories never create their own.
pub struct Services {
    pub session: Arc<WorkiqSession>,
    pub workiq: WorkiqConfig,
    pub http: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("prompt handler failed: {0}")]
    Prompt(String),
    #[error("script handler failed: {0}")]
    Script(String),
    #[error("workiq query failed: session: {session}; cli fallback: {cli}")]
    Combined { session: String, cli: String },
    #[error("endpoint '{0}' declares no handler")]
    Missing(String),
}

/// What a handler hands back to the endpoint host: either a JSON value or
/// plain text, serialized as-is.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutput {
    Json(Value),
    Text(String),
}

pub struct RequestContext {
    pub endpoint: String,
    pub method: HttpMethod,
    pub path: String,
}

/// Handler kind for one endpoint, resolved once at startup.
pub enum EndpointHandler {
    AiPrompt(PromptHandler),
    Script(ScriptRunner),
    WorkiqQuery(QueryHandler),
}

impl EndpointHandler {
    pub fn build(
        endpoint: &Endpoint,
        config: &ServiceConfig,
        services: &Services,
    ) -> Result<Self, HandlerError> {
        if let Some(spec) = &endpoint.ai_prompt {
            let handler = PromptHandler::new(
                endpoint,
                spec,
                config.default_model.as_deref(),
                services.http.clone(),
            )?;
            return Ok(Self::AiPrompt(handler));
        }
        if let Some(spec) = &endpoint.script_handler {
            return Ok(Self::Script(ScriptRunner::new(spec, &config.base_dir)?));
        }
        if let Some(spec) = &endpoint.workiq_query {
            return Ok(Self::WorkiqQuery(QueryHandler {
                template: spec.query.clone(),
                wants_json: endpoint.output_schema.is_some(),
                session: Arc::clone(&services.session),
                workiq: services.workiq.clone(),
            }));
        }
        // Unreachable for configs that passed validation.
        Err(HandlerError::Missing(endpoint.name.clone()))
    }

    pub async fn call(
        &self,
        input: Value,
        ctx: &RequestContext,
    ) -> Result<HandlerOutput, HandlerError> {
        match self {
            Self::AiPrompt(handler) => handler.call(&input).await,
            Self::Script(runner) => runner.call(&input).await,
            Self::WorkiqQuery(handler) => handler.call(&input, ctx).await,
        }
    }
}

/// Forwards a templated query to workiq, falling back to the one-shot CLI
/// when the session path fails.
pub struct QueryHandler {
    template: String,
    wants_json: bool,
    session: Arc<WorkiqSession>,
    workiq: WorkiqConfig,
}

impl QueryHandler {
    async fn call(&self, input: &Value, ctx: &RequestContext) -> Result<HandlerOutput, HandlerError> {
        let query = render_query(&self.template, input);
        let text = match self.session.ask(&query).await {
            Ok(text) => text,
            Err(session_err) => {
                warn!(
                    target: ENGINE_TARGET,
                    endpoint = %ctx.endpoint,
                    route = %format!("{} {}", ctx.method, ctx.path),
                    error = %session_err,
                    "workiq session failed; trying cli fallback"
                );
                match fallback::invoke_cli(&self.workiq, &query).await {
                    Ok(text) => text,
                    Err(cli_err) => {
                        return Err(HandlerError::Combined {
                            session: session_err.to_string(),
                            cli: cli_err.to_string(),
                        });
                    }
                }
            }
        };
        Ok(shape_output(text, self.wants_json))
    }
}

/// Substitutes every `{{key}}` placeholder with the string-coerced input
/// value. A template with no placeholders at all instead gets the whole
/// input appended as trailing context; the two behaviors never combine.
pub(crate) fn render_query(template: &str, input: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut substituted = false;
    while let Some(start) = rest.find("{{") {
        let Some(end) = rest[start + 2..].find("}}") else {
            break;
        };
        let key = rest[start + 2..start + 2 + end].trim();
        out.push_str(&rest[..start]);
        out.push_str(&coerce(input.get(key)));
        substituted = true;
        rest = &rest[start + 2 + end + 2..];
    }
    out.push_str(rest);
    if substituted {
        out
    } else {
        format!("{out} Context: {input}")
    }
}

fn coerce(value: Option<&Value>) -> String {
    match value {
        None => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn shape_output(text: String, wants_json: bool) -> HandlerOutput {
    if !wants_json {
        return HandlerOutput::Text(text);
    }
    match serde_json::from_str(&text) {
        Ok(value) => HandlerOutput::Json(value),
        Err(_) => HandlerOutput::Json(json!({"result": text})),
    }
}
