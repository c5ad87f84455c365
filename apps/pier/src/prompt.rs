use serde_json::{json, Value};
use tracing::warn;

use crate::config::{AiPrompt, Endpoint};
use crate::engine::{HandlerError, HandlerOutput};

const PROMPT_TARGET: &str = "pier::prompt";

const COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-5-mini";
const DEFAULT_TEMPERATURE: f64 = 1.0;

/// Calls the completion API with the endpoint's prompt and the request input
/// appended as JSON.
pub struct PromptHandler {
    client: reqwest::Client,
    api_key: String,
    model: String,
    temperature: f64,
    prompt: String,
    description: String,
    wants_json: bool,
}

impl PromptHandler {
    pub fn new(
        endpoint: &Endpoint,
        spec: &AiPrompt,
        default_model: Option<&str>,
        client: reqwest::Client,
    ) -> Result<Self, HandlerError> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            HandlerError::Prompt("OPENAI_API_KEY is required for aiPrompt handlers".to_string())
        })?;
        Ok(Self {
            client,
            api_key,
            model: spec
                .model
                .clone()
                .or_else(|| default_model.map(str::to_string))
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature: spec.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            prompt: spec.prompt.clone(),
            description: endpoint.description.clone(),
            wants_json: endpoint.output_schema.is_some(),
        })
    }

    pub async fn call(&self, input: &Value) -> Result<HandlerOutput, HandlerError> {
        let body = request_body(
            &self.prompt,
            &self.description,
            input,
            &self.model,
            self.temperature,
            self.wants_json,
        );
        let response = self
            .client
            .post(COMPLETIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| HandlerError::Prompt(format!("completion request failed: {err}")))?;

        let status = response.status();
        let payload: Value = response.json().await.map_err(|err| {
            HandlerError::Prompt(format!("invalid completion response: {err}"))
        })?;
        if !status.is_success() {
            let detail = payload
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(HandlerError::Prompt(format!(
                "completion API returned {status}: {detail}"
            )));
        }

        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if content.is_empty() {
            return Err(HandlerError::Prompt(
                "no content returned from completion API".to_string(),
            ));
        }

        match serde_json::from_str(content) {
            Ok(value) => Ok(HandlerOutput::Json(value)),
            Err(_) => {
                warn!(
                    target: PROMPT_TARGET,
                    "completion response was not valid JSON, returning wrapped text"
                );
                Ok(HandlerOutput::Json(json!({"result": content})))
            }
        }
    }
}

fn request_body(
    prompt: &str,
    description: &str,
    input: &Value,
    model: &str,
    temperature: f64,
    wants_json: bool,
) -> Value {
    let mut body = json!({
        "model": model,
        "messages": [
            {"role": "system", "content": description},
            {"role": "user", "content": format!("{prompt}\n\nInput JSON:\n{input}")},
        ],
        "temperature": temperature,
    });
    if wants_json {
        body["response_format"] = json!({"type": "json_object"});
    }
    body
}

#[cfg(test)]
mod tests {
    use std::sync::{LazyLock, Mutex};

    use super::*;
    use crate::config::HttpMethod;

    // Environment-variable tests must not run in parallel.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn sample_endpoint() -> Endpoint {
        Endpoint {
            name: "summary".to_string(),
            description: "Summarizes the input".to_string(),
            path: "/summary".to_string(),
            method: HttpMethod::Post,
            input_schema: None,
            output_schema: None,
            ai_prompt: Some(AiPrompt {
                prompt: "Summarize this".to_string(),
                model: None,
                temperature: None,
            }),
            script_handler: None,
            workiq_query: None,
        }
    }

    #[test]
    fn request_body_includes_prompt_and_input() {
        let body = request_body(
            "Summarize this",
            "Summarizes the input",
            &json!({"text": "hello"}),
            "gpt-5-mini",
            1.0,
            false,
        );
        assert_eq!(body.pointer("/model"), Some(&json!("gpt-5-mini")));
        assert_eq!(
            body.pointer("/messages/0/content"),
            Some(&json!("Summarizes the input"))
        );
        let user = body
            .pointer("/messages/1/content")
            .and_then(Value::as_str)
            .expect("no user message");
        assert!(user.starts_with("Summarize this"));
        assert!(user.contains("{\"text\":\"hello\"}"));
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn request_body_asks_for_json_when_schema_declared() {
        let body = request_body("p", "d", &json!({}), "m", 0.2, true);
        assert_eq!(
            body.pointer("/response_format/type"),
            Some(&json!("json_object"))
        );
    }

    #[test]
    fn missing_api_key_fails_at_build_time() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let original = std::env::var("OPENAI_API_KEY").ok();
        std::env::remove_var("OPENAI_API_KEY");

        let endpoint = sample_endpoint();
        let spec = endpoint.ai_prompt.clone().expect("no prompt spec");
        let result = PromptHandler::new(&endpoint, &spec, None, reqwest::Client::new());
        assert!(result.is_err());

        if let Some(value) = original {
            std::env::set_var("OPENAI_API_KEY", value);
        }
    }

    #[test]
    fn model_resolution_prefers_endpoint_then_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let original = std::env::var("OPENAI_API_KEY").ok();
        std::env::set_var("OPENAI_API_KEY", "test-key");

        let endpoint = sample_endpoint();
        let spec = AiPrompt {
            prompt: "p".to_string(),
            model: Some("endpoint-model".to_string()),
            temperature: None,
        };
        let handler =
            PromptHandler::new(&endpoint, &spec, Some("config-model"), reqwest::Client::new())
                .expect("build failed");
        assert_eq!(handler.model, "endpoint-model");

        let spec = AiPrompt {
            prompt: "p".to_string(),
            model: None,
            temperature: None,
        };
        let handler =
            PromptHandler::new(&endpoint, &spec, Some("config-model"), reqwest::Client::new())
                .expect("build failed");
        assert_eq!(handler.model, "config-model");

        match original {
            Some(value) => std::env::set_var("OPENAI_API_KEY", value),
            None => std::env::remove_var("OPENAI_API_KEY"),
        }
    }
}
