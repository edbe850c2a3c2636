//! Outbound replies to the channel connector.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, warn};

use courier_teams::{messages::OutgoingActivity, Activity, ActivitySender, SendError};

/// Posts replies to `{serviceUrl}/v3/conversations/{id}/activities`.
pub struct BotConnector {
    client: Client,
    bearer_token: Option<SecretString>,
}

impl BotConnector {
    pub fn new(client: Client, bearer_token: Option<SecretString>) -> Self {
        Self { client, bearer_token }
    }
}

#[async_trait]
impl ActivitySender for BotConnector {
    async fn send(&self, inbound: &Activity, reply: OutgoingActivity) -> Result<(), SendError> {
        let url = activities_url(inbound)?;
        let body = address_reply(inbound, &reply)?;

        let mut request = self.client.post(url.clone()).json(&body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|error| {
            warn!(
                event_name = "connector.send.failed",
                correlation_id = %inbound.correlation_id(),
                error = %error,
                "channel connector request failed"
            );
            SendError(error.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                event_name = "connector.send.rejected",
                correlation_id = %inbound.correlation_id(),
                status = status.as_u16(),
                "channel connector rejected the reply"
            );
            return Err(SendError(format!("connector returned {status}")));
        }

        debug!(
            event_name = "connector.send.delivered",
            correlation_id = %inbound.correlation_id(),
            url = %url,
            "reply delivered"
        );
        Ok(())
    }
}

/// Drops replies while counting them; used when load testing the relay.
#[derive(Default)]
pub struct LoadTestSender {
    suppressed: AtomicUsize,
}

impl LoadTestSender {
    pub fn suppressed(&self) -> usize {
        self.suppressed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ActivitySender for LoadTestSender {
    async fn send(&self, inbound: &Activity, reply: OutgoingActivity) -> Result<(), SendError> {
        let suppressed = self.suppressed.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            event_name = "connector.send.suppressed",
            correlation_id = %inbound.correlation_id(),
            suppressed,
            bytes = reply.text().len(),
            "load test mode: reply suppressed"
        );
        Ok(())
    }
}

fn activities_url(inbound: &Activity) -> Result<Url, SendError> {
    let service_url = inbound
        .service_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| SendError("activity has no serviceUrl".to_owned()))?;
    let conversation_id =
        inbound.conversation_id().ok_or_else(|| SendError("activity has no conversation id".to_owned()))?;

    let mut url = Url::parse(service_url).map_err(|error| SendError(format!("invalid serviceUrl: {error}")))?;
    url.path_segments_mut()
        .map_err(|_| SendError("serviceUrl cannot carry a path".to_owned()))?
        .pop_if_empty()
        .extend(["v3", "conversations", conversation_id, "activities"]);
    Ok(url)
}

/// Swaps sender and recipient and threads the reply to the inbound activity.
fn address_reply(inbound: &Activity, reply: &OutgoingActivity) -> Result<Value, SendError> {
    let mut body = serde_json::to_value(reply).map_err(|error| SendError(error.to_string()))?;
    let Value::Object(fields) = &mut body else {
        return Err(SendError("reply did not serialize to an object".to_owned()));
    };

    let mut insert = |key: &str, value: Option<Value>| {
        if let Some(value) = value {
            fields.entry(key.to_owned()).or_insert(value);
        }
    };
    insert("from", inbound.recipient.as_ref().and_then(|account| serde_json::to_value(account).ok()));
    insert("recipient", inbound.from.as_ref().and_then(|account| serde_json::to_value(account).ok()));
    insert(
        "conversation",
        inbound.conversation.as_ref().and_then(|conversation| serde_json::to_value(conversation).ok()),
    );
    insert("replyToId", inbound.id.clone().map(Value::String));

    Ok(body)
}
