use std::sync::Arc;

use axum::Router;
use courier_core::config::{AppConfig, ConfigError, LoadOptions};
use courier_core::{FeedbackTracker, SystemClock};
use courier_teams::{default_dispatcher, ActivitySender, EventDispatcher, TurnProcessor, TurnSettings};
use reqwest::Client;
use thiserror::Error;
use tracing::info;

use crate::connector::{BotConnector, LoadTestSender};
use crate::proxy::ProxySettings;
use crate::registration::RegistrationClient;
use crate::webhook::WebhookClient;
use crate::{health, messages, proxy, telemetry};

pub struct Application {
    pub config: AppConfig,
    pub client: Client,
    pub feedback: Arc<FeedbackTracker>,
    pub dispatcher: Arc<EventDispatcher>,
    /// Present only in load-test mode, where replies are counted instead of sent.
    pub load_test: Option<Arc<LoadTestSender>>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("http client construction failed: {0}")]
    HttpClient(#[source] reqwest::Error),
    #[error("account linking is enabled but the registration client could not be configured")]
    RegistrationUnavailable,
}

pub fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config)
}

pub fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", correlation_id = "bootstrap", "starting application bootstrap");

    let client = Client::builder()
        .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(BootstrapError::HttpClient)?;
    let feedback = Arc::new(FeedbackTracker::new(Arc::new(SystemClock)));
    let relay = Arc::new(WebhookClient::from_config(client.clone(), &config.webhook));

    let (sender, load_test): (Arc<dyn ActivitySender>, Option<Arc<LoadTestSender>>) =
        if config.channel.load_test_mode {
            let sender = Arc::new(LoadTestSender::default());
            (sender.clone(), Some(sender))
        } else {
            (Arc::new(BotConnector::new(client.clone(), config.channel.bearer_token.clone())), None)
        };

    let mut processor =
        TurnProcessor::new(relay, sender, feedback.clone(), TurnSettings::from(&config.features));
    match RegistrationClient::from_config(client.clone(), &config.registration) {
        Some(registration) => {
            let registration = Arc::new(registration);
            processor = processor.with_identity_lookup(registration.clone());
            if config.features.account_link_enabled {
                processor = processor.with_account_link(registration);
            }
        }
        None if config.features.account_link_enabled => {
            return Err(BootstrapError::RegistrationUnavailable);
        }
        None => {}
    }

    let dispatcher = Arc::new(default_dispatcher(Arc::new(processor)));
    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        handlers = dispatcher.handler_count(),
        load_test_mode = config.channel.load_test_mode,
        feedback_enabled = config.features.feedback_enabled,
        "application bootstrap complete"
    );

    Ok(Application { config, client, feedback, dispatcher, load_test })
}

pub fn build_router(app: &Application) -> Router {
    let settings = Arc::new(ProxySettings::from_config(&app.config));
    Router::new()
        .merge(messages::router(app.dispatcher.clone()))
        .merge(health::router(app.config.server.port))
        .merge(proxy::router(app.client.clone(), settings.clone()))
        .merge(telemetry::router(app.client.clone(), settings))
}
