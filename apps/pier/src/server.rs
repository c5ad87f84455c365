use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::Query,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use workiq_client::WorkiqSession;

use crate::config::{workiq_config_from_env, Endpoint, HttpMethod, ServiceConfig};
use crate::engine::{EndpointHandler, HandlerError, HandlerOutput, RequestContext, Services};

const SERVER_TARGET: &str = "pier::server";

struct RouteState {
    endpoint: Endpoint,
    handler: EndpointHandler,
}

pub async fn run(config: ServiceConfig, port: u16) -> anyhow::Result<()> {
    let workiq = workiq_config_from_env();
    let services = Services {
        session: Arc::new(WorkiqSession::new(workiq.clone())),
        workiq,
        http: reqwest::Client::new(),
    };
    let session = Arc::clone(&services.session);

    let app = build_router(&config, &services)
        .map_err(|err| anyhow::anyhow!("failed to build endpoints: {err}"))?;

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(target: SERVER_TARGET, addr = %addr, "pier listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Reap the workiq subprocess before exiting.
    session.shutdown().await;
    info!(target: SERVER_TARGET, "shutdown complete");
    Ok(())
}

pub fn build_router(config: &ServiceConfig, services: &Services) -> Result<Router, HandlerError> {
    let mut router = Router::new().route("/__health", get(health_check));
    for endpoint in &config.endpoints {
        let handler = EndpointHandler::build(endpoint, config, services)?;
        let state = Arc::new(RouteState {
            endpoint: endpoint.clone(),
            handler,
        });
        info!(
            target: SERVER_TARGET,
            method = %endpoint.method,
            path = %endpoint.path,
            name = %endpoint.name,
            "binding endpoint"
        );
        router = match endpoint.method {
            HttpMethod::Get => router.route(
                &endpoint.path,
                get(move |Query(params): Query<HashMap<String, String>>| {
                    let state = Arc::clone(&state);
                    async move { serve_request(state, query_input(params)).await }
                }),
            ),
            HttpMethod::Post => router.route(
                &endpoint.path,
                post(move |Json(input): Json<Value>| {
                    let state = Arc::clone(&state);
                    async move { serve_request(state, input).await }
                }),
            ),
        };
    }
    Ok(router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http()))
}

async fn health_check() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

fn query_input(params: HashMap<String, String>) -> Value {
    Value::Object(
        params
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect(),
    )
}

async fn serve_request(state: Arc<RouteState>, input: Value) -> Response {
    let endpoint = &state.endpoint;

    if let Some(schema) = &endpoint.input_schema {
        let missing = missing_required(schema, &input);
        if !missing.is_empty() {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "Invalid request",
                    "details": format!("missing required properties: {}", missing.join(", ")),
                })),
            )
                .into_response();
        }
    }

    let ctx = RequestContext {
        endpoint: endpoint.name.clone(),
        method: endpoint.method,
        path: endpoint.path.clone(),
    };
    match state.handler.call(input, &ctx).await {
        Ok(output) => {
            if let (Some(schema), HandlerOutput::Json(value)) = (&endpoint.output_schema, &output) {
                let missing = missing_required(schema, value);
                if !missing.is_empty() {
                    error!(
                        target: SERVER_TARGET,
                        endpoint = %endpoint.name,
                        "handler output failed validation"
                    );
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({
                            "error": "Handler output failed validation",
                            "details": format!(
                                "missing required properties: {}",
                                missing.join(", ")
                            ),
                        })),
                    )
                        .into_response();
                }
            }
            match output {
                HandlerOutput::Json(value) => Json(value).into_response(),
                HandlerOutput::Text(text) => Json(Value::String(text)).into_response(),
            }
        }
        Err(err) => {
            error!(
                target: SERVER_TARGET,
                endpoint = %endpoint.name,
                error = %err,
                "handler failed"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Handler error", "detail": err.to_string()})),
            )
                .into_response()
        }
    }
}

/// Required top-level properties declared by the schema that the value does
/// not carry.
fn missing_required(schema: &Value, value: &Value) -> Vec<String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Vec::new();
    };
    let object = value.as_object();
    required
        .iter()
        .filter_map(Value::as_str)
        .filter(|key| object.map_or(true, |map| !map.contains_key(*key)))
        .map(str::to_string)
        .collect()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(target: SERVER_TARGET, "received shutdown signal");
}
