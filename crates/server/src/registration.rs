//! Registration API client issuing magic links for account linking.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use courier_core::config::{non_blank_secret, RegistrationConfig};
use courier_teams::enrich::ExtendedIdentity;
use courier_teams::{AccountLinkProvider, Activity, IdentityLookup};

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("registration API returned {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("registration API reported failure: {0}")]
    Unsuccessful(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegistrationRequest {
    pub name: String,
    pub org_uuid: String,
    pub workflow_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_uuid: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Registration {
    pub magic_link: String,
    #[serde(default)]
    pub user_id: Option<Value>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub organisation: Option<Value>,
}

#[derive(Deserialize)]
struct RegistrationEnvelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(flatten)]
    registration: Option<Registration>,
}

pub struct RegistrationClient {
    client: Client,
    base_url: String,
    api_user: String,
    api_password: SecretString,
    org_uuid: String,
    org_name: Option<String>,
    registered: RwLock<HashMap<String, Registration>>,
}

impl RegistrationClient {
    /// `None` unless base URL, credentials and organisation are all configured.
    pub fn from_config(client: Client, config: &RegistrationConfig) -> Option<Self> {
        let base_url = non_blank(config.base_url.as_deref())?;
        let api_user = non_blank(config.api_user.as_deref())?;
        let api_password = non_blank_secret(config.api_password.as_ref())?;
        let org_uuid = non_blank(config.org_uuid.as_deref())?;

        Some(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_user: api_user.to_owned(),
            api_password: api_password.to_owned().into(),
            org_uuid: org_uuid.to_owned(),
            org_name: non_blank(config.org_name.as_deref()).map(str::to_owned),
            registered: RwLock::new(HashMap::new()),
        })
    }

    pub async fn register(&self, request: &RegistrationRequest) -> Result<Registration, RegistrationError> {
        let response = self
            .client
            .post(format!("{}/api/register", self.base_url))
            .timeout(REGISTRATION_TIMEOUT)
            .basic_auth(&self.api_user, Some(self.api_password.expose_secret()))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let envelope = serde_json::from_str::<RegistrationEnvelope>(&body).ok();

        if !status.is_success() {
            let message = envelope
                .and_then(|envelope| envelope.error.or(envelope.message))
                .unwrap_or(body);
            return Err(RegistrationError::Rejected { status: status.as_u16(), message });
        }

        match envelope {
            Some(RegistrationEnvelope { success: true, registration: Some(registration), .. }) => {
                self.registered
                    .write()
                    .await
                    .insert(request.workflow_user_id.clone(), registration.clone());
                info!(
                    event_name = "registration.user.registered",
                    workflow_user_id = %request.workflow_user_id,
                    "user registered; magic link issued"
                );
                Ok(registration)
            }
            Some(envelope) => Err(RegistrationError::Unsuccessful(
                envelope.error.or(envelope.message).unwrap_or_else(|| "no magic link returned".to_owned()),
            )),
            None => Err(RegistrationError::Unsuccessful("undecodable response body".to_owned())),
        }
    }

    pub fn request_for(&self, activity: &Activity) -> Option<RegistrationRequest> {
        let workflow_user_id = activity.user_id()?;
        Some(RegistrationRequest {
            name: activity.user_name().unwrap_or(workflow_user_id).to_owned(),
            org_uuid: self.org_uuid.clone(),
            workflow_user_id: workflow_user_id.to_owned(),
            org_name: self.org_name.clone(),
            channel_uuid: activity.tenant_id().map(str::to_owned),
        })
    }
}

#[async_trait]
impl AccountLinkProvider for RegistrationClient {
    async fn magic_link(&self, activity: &Activity) -> anyhow::Result<String> {
        let request = self.request_for(activity).context("activity carries no user id")?;
        let registration = self.register(&request).await?;
        Ok(registration.magic_link)
    }
}

/// Email of an already registered user; never calls the registration API.
#[async_trait]
impl IdentityLookup for RegistrationClient {
    async fn lookup(&self, activity: &Activity) -> anyhow::Result<ExtendedIdentity> {
        let Some(user_id) = activity.user_id() else {
            return Ok(ExtendedIdentity::default());
        };
        let email = self.registered.read().await.get(user_id).and_then(|registration| registration.email.clone());
        Ok(ExtendedIdentity { email })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
