//! Delivery of enriched activities to the workflow webhook.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{info, warn};

use courier_core::config::WebhookConfig;
use courier_core::DeliveryFailure;
use courier_teams::{EventContext, WorkflowRelay};

pub struct WebhookClient {
    client: Client,
    url: String,
    basic_auth: Option<(String, SecretString)>,
    timeout: Duration,
}

impl WebhookClient {
    pub fn new(
        client: Client,
        url: impl Into<String>,
        basic_auth: Option<(String, SecretString)>,
        timeout: Duration,
    ) -> Self {
        Self { client, url: url.into(), basic_auth, timeout }
    }

    pub fn from_config(client: Client, config: &WebhookConfig) -> Self {
        let basic_auth = config
            .basic_auth()
            .map(|(username, password)| (username.to_owned(), password.clone()));
        Self::new(client, config.url.clone(), basic_auth, Duration::from_secs(config.timeout_secs))
    }
}

#[async_trait]
impl WorkflowRelay for WebhookClient {
    async fn relay(&self, payload: &Value, ctx: &EventContext) -> Result<Option<Value>, DeliveryFailure> {
        let started = Instant::now();
        let mut request = self.client.post(&self.url).timeout(self.timeout).json(payload);
        if let Some((username, password)) = &self.basic_auth {
            request = request.basic_auth(username, Some(password.expose_secret()));
        }

        let response = request.send().await.map_err(|error| {
            let failure = classify_transport_error(&error);
            warn!(
                event_name = "webhook.request.failed",
                correlation_id = %ctx.correlation_id,
                failure = failure.label(),
                error = %error,
                "workflow webhook request failed"
            );
            failure
        })?;

        let status = response.status();
        if !status.is_success() {
            let failure = DeliveryFailure::from_status(status.as_u16());
            warn!(
                event_name = "webhook.response.rejected",
                correlation_id = %ctx.correlation_id,
                status = status.as_u16(),
                failure = failure.label(),
                "workflow webhook returned a non-success status"
            );
            return Err(failure);
        }

        let body = response.text().await.map_err(|error| classify_transport_error(&error))?;
        info!(
            event_name = "webhook.response.received",
            correlation_id = %ctx.correlation_id,
            status = status.as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            bytes = body.len(),
            "workflow webhook answered"
        );

        Ok(normalize_body(&body))
    }
}

fn classify_transport_error(error: &reqwest::Error) -> DeliveryFailure {
    if error.is_timeout() {
        return DeliveryFailure::Timeout;
    }
    error.status().map(|status| DeliveryFailure::from_status(status.as_u16())).unwrap_or(DeliveryFailure::Generic)
}

/// A body that is not JSON is treated as a bare text answer.
pub fn normalize_body(body: &str) -> Option<Value> {
    if body.trim().is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(body) {
        Ok(value) => normalize_output(value),
        Err(_) => Some(Value::String(body.to_owned())),
    }
}

/// Reduces the accepted response shapes to one value for the unwrapper:
/// `{output}`, `[{output}]`, `{output: [{output, attachment}]}` and bare strings.
pub fn normalize_output(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Array(items) => items.into_iter().next().and_then(normalize_output),
        Value::Object(mut fields) => {
            match fields.get("output").filter(|output| !output.is_null()).map(Value::is_array) {
                None => None,
                Some(false) => Some(Value::Object(fields)),
                Some(true) => match fields.remove("output") {
                    Some(Value::Array(items)) => items.into_iter().next().and_then(normalize_output),
                    _ => None,
                },
            }
        }
        other => Some(other),
    }
}
