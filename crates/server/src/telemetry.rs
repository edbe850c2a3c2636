use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{field, info, info_span, warn, Instrument, Span};

use courier_core::config::non_blank_secret;

use crate::proxy::{record_outcome, ProxySettings};

#[derive(Clone)]
pub struct TelemetryState {
    client: Client,
    settings: Arc<ProxySettings>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReport {
    pub message: &'static str,
    pub tracing_enabled: bool,
    pub project_name: String,
    pub upstream_response: Value,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFailure {
    pub error: &'static str,
    pub message: String,
    pub tracing_enabled: bool,
}

pub fn router(client: Client, settings: Arc<ProxySettings>) -> Router {
    Router::new()
        .route("/api/test-telemetry", get(test_telemetry))
        .with_state(TelemetryState { client, settings })
}

/// Sends one tiny chat completion upstream so the trace pipeline can be checked end to end.
pub async fn test_telemetry(
    State(state): State<TelemetryState>,
) -> Result<(StatusCode, Json<TelemetryReport>), (StatusCode, Json<TelemetryFailure>)> {
    let settings = &state.settings;
    let span = if settings.tracing_enabled {
        info_span!(
            "llm.telemetry_probe",
            project = %settings.project_name,
            deployment = %settings.deployment,
            status = field::Empty,
            latency_ms = field::Empty,
            prompt_tokens = field::Empty,
            completion_tokens = field::Empty,
            total_tokens = field::Empty,
        )
    } else {
        Span::none()
    };

    match probe(&state.client, settings).instrument(span).await {
        Ok(upstream_response) => {
            info!(event_name = "telemetry.probe.completed", "telemetry probe succeeded");
            Ok((
                StatusCode::OK,
                Json(TelemetryReport {
                    message: "Telemetry test completed successfully",
                    tracing_enabled: settings.tracing_enabled,
                    project_name: settings.project_name.clone(),
                    upstream_response,
                    timestamp: Utc::now().to_rfc3339(),
                }),
            ))
        }
        Err(message) => {
            warn!(event_name = "telemetry.probe.failed", error = %message, "telemetry probe failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(TelemetryFailure {
                    error: "Telemetry test failed",
                    message,
                    tracing_enabled: settings.tracing_enabled,
                }),
            ))
        }
    }
}

async fn probe(client: &Client, settings: &ProxySettings) -> Result<Value, String> {
    let endpoint = settings
        .endpoint
        .as_deref()
        .map(str::trim)
        .filter(|endpoint| !endpoint.is_empty())
        .ok_or_else(|| "upstream.endpoint is not configured".to_owned())?;
    let api_key = non_blank_secret(settings.api_key.as_ref())
        .ok_or_else(|| "upstream.api_key is not configured".to_owned())?;

    let url = format!(
        "{}/openai/deployments/{}/chat/completions?api-version={}",
        endpoint.trim_end_matches('/'),
        settings.deployment,
        settings.api_version
    );
    let request = json!({
        "messages": [
            { "role": "system", "content": "You are a test assistant." },
            { "role": "user", "content": "Reply with 'Telemetry test successful'." }
        ],
        "max_tokens": 10,
        "temperature": 0
    });

    let started = Instant::now();
    let response = client
        .request(Method::POST, url)
        .header("api-key", api_key)
        .json(&request)
        .send()
        .await
        .map_err(|error| error.to_string())?;
    let status = response.status();
    let body: Value = response.json().await.map_err(|error| error.to_string())?;
    record_outcome(&Span::current(), status.as_u16(), started.elapsed().as_millis() as u64, body.get("usage"));

    if !status.is_success() {
        return Err(format!("upstream returned {status}"));
    }
    Ok(body)
}
