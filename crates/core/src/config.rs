use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_DEPLOYMENT: &str = "gpt-4.1";
pub const DEFAULT_API_VERSION: &str = "2024-12-01-preview";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub webhook: WebhookConfig,
    pub upstream: UpstreamConfig,
    pub channel: ChannelConfig,
    pub features: FeatureConfig,
    pub registration: RegistrationConfig,
    pub server: ServerConfig,
    pub tracing: TracingConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub url: String,
    pub basic_auth_username: Option<String>,
    pub basic_auth_password: Option<SecretString>,
    pub timeout_secs: u64,
}

impl WebhookConfig {
    pub fn basic_auth(&self) -> Option<(&str, &SecretString)> {
        match (&self.basic_auth_username, &self.basic_auth_password) {
            (Some(username), Some(password)) => Some((username.as_str(), password)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<SecretString>,
    pub deployment: String,
    pub api_version: String,
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub bearer_token: Option<SecretString>,
    pub load_test_mode: bool,
}

#[derive(Clone, Debug)]
pub struct FeatureConfig {
    pub feedback_enabled: bool,
    pub tips_enabled: bool,
    pub account_link_enabled: bool,
    pub usage_status_enabled: bool,
}

#[derive(Clone, Debug)]
pub struct RegistrationConfig {
    pub base_url: Option<String>,
    pub api_user: Option<String>,
    pub api_password: Option<SecretString>,
    pub org_uuid: Option<String>,
    pub org_name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct TracingConfig {
    pub enabled: bool,
    pub project_name: String,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub webhook_url: Option<String>,
    pub log_level: Option<String>,
    pub upstream_endpoint: Option<String>,
    pub upstream_api_key: Option<String>,
    pub load_test_mode: Option<bool>,
    pub feedback_enabled: Option<bool>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            webhook: WebhookConfig {
                url: String::new(),
                basic_auth_username: None,
                basic_auth_password: None,
                timeout_secs: 60,
            },
            upstream: UpstreamConfig {
                endpoint: None,
                api_key: None,
                deployment: DEFAULT_DEPLOYMENT.to_string(),
                api_version: DEFAULT_API_VERSION.to_string(),
            },
            channel: ChannelConfig { bearer_token: None, load_test_mode: false },
            features: FeatureConfig {
                feedback_enabled: true,
                tips_enabled: false,
                account_link_enabled: false,
                usage_status_enabled: false,
            },
            registration: RegistrationConfig {
                base_url: None,
                api_user: None,
                api_password: None,
                org_uuid: None,
                org_name: None,
            },
            server: ServerConfig { bind_address: "0.0.0.0".to_string(), port: 3978 },
            tracing: TracingConfig { enabled: false, project_name: "courier".to_string() },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("courier.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(webhook) = patch.webhook {
            if let Some(url) = webhook.url {
                self.webhook.url = url;
            }
            if let Some(username) = webhook.basic_auth_username {
                self.webhook.basic_auth_username = Some(username);
            }
            if let Some(password) = webhook.basic_auth_password {
                self.webhook.basic_auth_password = Some(secret_value(password));
            }
            if let Some(timeout_secs) = webhook.timeout_secs {
                self.webhook.timeout_secs = timeout_secs;
            }
        }

        if let Some(upstream) = patch.upstream {
            if let Some(endpoint) = upstream.endpoint {
                self.upstream.endpoint = Some(endpoint);
            }
            if let Some(api_key) = upstream.api_key {
                self.upstream.api_key = Some(secret_value(api_key));
            }
            if let Some(deployment) = upstream.deployment {
                self.upstream.deployment = deployment;
            }
            if let Some(api_version) = upstream.api_version {
                self.upstream.api_version = api_version;
            }
        }

        if let Some(channel) = patch.channel {
            if let Some(bearer_token) = channel.bearer_token {
                self.channel.bearer_token = Some(secret_value(bearer_token));
            }
            if let Some(load_test_mode) = channel.load_test_mode {
                self.channel.load_test_mode = load_test_mode;
            }
        }

        if let Some(features) = patch.features {
            if let Some(enabled) = features.feedback_enabled {
                self.features.feedback_enabled = enabled;
            }
            if let Some(enabled) = features.tips_enabled {
                self.features.tips_enabled = enabled;
            }
            if let Some(enabled) = features.account_link_enabled {
                self.features.account_link_enabled = enabled;
            }
            if let Some(enabled) = features.usage_status_enabled {
                self.features.usage_status_enabled = enabled;
            }
        }

        if let Some(registration) = patch.registration {
            if let Some(base_url) = registration.base_url {
                self.registration.base_url = Some(base_url);
            }
            if let Some(api_user) = registration.api_user {
                self.registration.api_user = Some(api_user);
            }
            if let Some(api_password) = registration.api_password {
                self.registration.api_password = Some(secret_value(api_password));
            }
            if let Some(org_uuid) = registration.org_uuid {
                self.registration.org_uuid = Some(org_uuid);
            }
            if let Some(org_name) = registration.org_name {
                self.registration.org_name = Some(org_name);
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
        }

        if let Some(tracing) = patch.tracing {
            if let Some(enabled) = tracing.enabled {
                self.tracing.enabled = enabled;
            }
            if let Some(project_name) = tracing.project_name {
                self.tracing.project_name = project_name;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("COURIER_WEBHOOK_URL") {
            self.webhook.url = value;
        }
        if let Some(value) = read_env("COURIER_WEBHOOK_BASIC_AUTH_USERNAME") {
            self.webhook.basic_auth_username = Some(value);
        }
        if let Some(value) = read_env("COURIER_WEBHOOK_BASIC_AUTH_PASSWORD") {
            self.webhook.basic_auth_password = Some(secret_value(value));
        }
        if let Some(value) = read_env("COURIER_WEBHOOK_TIMEOUT_SECS") {
            self.webhook.timeout_secs = parse_u64("COURIER_WEBHOOK_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("COURIER_UPSTREAM_ENDPOINT") {
            self.upstream.endpoint = Some(value);
        }
        if let Some(value) = read_env("COURIER_UPSTREAM_API_KEY") {
            self.upstream.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("COURIER_UPSTREAM_DEPLOYMENT") {
            self.upstream.deployment = value;
        }
        if let Some(value) = read_env("COURIER_UPSTREAM_API_VERSION") {
            self.upstream.api_version = value;
        }

        if let Some(value) = read_env("COURIER_CHANNEL_BEARER_TOKEN") {
            self.channel.bearer_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("COURIER_CHANNEL_LOAD_TEST_MODE") {
            self.channel.load_test_mode = parse_bool("COURIER_CHANNEL_LOAD_TEST_MODE", &value)?;
        }

        if let Some(value) = read_env("COURIER_FEATURES_FEEDBACK_ENABLED") {
            self.features.feedback_enabled =
                parse_bool("COURIER_FEATURES_FEEDBACK_ENABLED", &value)?;
        }
        if let Some(value) = read_env("COURIER_FEATURES_TIPS_ENABLED") {
            self.features.tips_enabled = parse_bool("COURIER_FEATURES_TIPS_ENABLED", &value)?;
        }
        if let Some(value) = read_env("COURIER_FEATURES_ACCOUNT_LINK_ENABLED") {
            self.features.account_link_enabled =
                parse_bool("COURIER_FEATURES_ACCOUNT_LINK_ENABLED", &value)?;
        }
        if let Some(value) = read_env("COURIER_FEATURES_USAGE_STATUS_ENABLED") {
            self.features.usage_status_enabled =
                parse_bool("COURIER_FEATURES_USAGE_STATUS_ENABLED", &value)?;
        }

        if let Some(value) = read_env("COURIER_REGISTRATION_BASE_URL") {
            self.registration.base_url = Some(value);
        }
        if let Some(value) = read_env("COURIER_REGISTRATION_API_USER") {
            self.registration.api_user = Some(value);
        }
        if let Some(value) = read_env("COURIER_REGISTRATION_API_PASSWORD") {
            self.registration.api_password = Some(secret_value(value));
        }
        if let Some(value) = read_env("COURIER_REGISTRATION_ORG_UUID") {
            self.registration.org_uuid = Some(value);
        }
        if let Some(value) = read_env("COURIER_REGISTRATION_ORG_NAME") {
            self.registration.org_name = Some(value);
        }

        if let Some(value) = read_env("COURIER_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("COURIER_SERVER_PORT") {
            self.server.port = parse_u16("COURIER_SERVER_PORT", &value)?;
        }

        if let Some(value) = read_env("COURIER_TRACING_ENABLED") {
            self.tracing.enabled = parse_bool("COURIER_TRACING_ENABLED", &value)?;
        }
        if let Some(value) = read_env("COURIER_TRACING_PROJECT_NAME") {
            self.tracing.project_name = value;
        }

        let log_level =
            read_env("COURIER_LOGGING_LEVEL").or_else(|| read_env("COURIER_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("COURIER_LOGGING_FORMAT").or_else(|| read_env("COURIER_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(webhook_url) = overrides.webhook_url {
            self.webhook.url = webhook_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(endpoint) = overrides.upstream_endpoint {
            self.upstream.endpoint = Some(endpoint);
        }
        if let Some(api_key) = overrides.upstream_api_key {
            self.upstream.api_key = Some(secret_value(api_key));
        }
        if let Some(load_test_mode) = overrides.load_test_mode {
            self.channel.load_test_mode = load_test_mode;
        }
        if let Some(feedback_enabled) = overrides.feedback_enabled {
            self.features.feedback_enabled = feedback_enabled;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_webhook(&self.webhook)?;
        validate_upstream(&self.upstream)?;
        validate_registration(&self.features, &self.registration)?;
        validate_server(&self.server)?;
        validate_tracing(&self.tracing)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("courier.toml"), PathBuf::from("config/courier.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn validate_webhook(webhook: &WebhookConfig) -> Result<(), ConfigError> {
    let url = webhook.url.trim();
    if url.is_empty() {
        return Err(ConfigError::Validation(
            "webhook.url is required. Set COURIER_WEBHOOK_URL to the workflow webhook endpoint"
                .to_string(),
        ));
    }
    if !is_http_url(url) {
        return Err(ConfigError::Validation(
            "webhook.url must start with http:// or https://".to_string(),
        ));
    }

    let has_username = webhook.basic_auth_username.is_some();
    let has_password = webhook.basic_auth_password.is_some();
    if has_username != has_password {
        return Err(ConfigError::Validation(
            "webhook.basic_auth_username and webhook.basic_auth_password must be set together"
                .to_string(),
        ));
    }

    if webhook.timeout_secs == 0 || webhook.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "webhook.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_upstream(upstream: &UpstreamConfig) -> Result<(), ConfigError> {
    if let Some(endpoint) = &upstream.endpoint {
        if !is_http_url(endpoint.trim()) {
            return Err(ConfigError::Validation(
                "upstream.endpoint must start with http:// or https://".to_string(),
            ));
        }
    }

    if upstream.deployment.trim().is_empty() {
        return Err(ConfigError::Validation("upstream.deployment must not be empty".to_string()));
    }

    if upstream.api_version.trim().is_empty() {
        return Err(ConfigError::Validation("upstream.api_version must not be empty".to_string()));
    }

    Ok(())
}

fn validate_registration(
    features: &FeatureConfig,
    registration: &RegistrationConfig,
) -> Result<(), ConfigError> {
    if let Some(base_url) = &registration.base_url {
        if !is_http_url(base_url.trim()) {
            return Err(ConfigError::Validation(
                "registration.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    if !features.account_link_enabled {
        return Ok(());
    }

    let missing: Vec<&str> = [
        ("registration.base_url", is_blank(registration.base_url.as_deref())),
        ("registration.api_user", is_blank(registration.api_user.as_deref())),
        ("registration.api_password", non_blank_secret(registration.api_password.as_ref()).is_none()),
        ("registration.org_uuid", is_blank(registration.org_uuid.as_deref())),
    ]
    .into_iter()
    .filter_map(|(key, is_missing)| is_missing.then_some(key))
    .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!(
            "features.account_link_enabled is true but {} missing",
            missing.join(", ")
        )))
    }
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.bind_address.trim().is_empty() {
        return Err(ConfigError::Validation("server.bind_address must not be empty".to_string()));
    }

    Ok(())
}

fn validate_tracing(tracing: &TracingConfig) -> Result<(), ConfigError> {
    if tracing.enabled && tracing.project_name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "tracing.project_name is required when tracing is enabled".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

/// Returns the secret's value only when it is non-blank.
fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |value| value.trim().is_empty())
}

pub fn non_blank_secret(secret: Option<&SecretString>) -> Option<&str> {
    secret.map(|value| value.expose_secret()).filter(|value| !value.trim().is_empty())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.trim().to_ascii_lowercase().parse::<bool>().map_err(|_| {
        ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    webhook: Option<WebhookPatch>,
    upstream: Option<UpstreamPatch>,
    channel: Option<ChannelPatch>,
    features: Option<FeaturePatch>,
    registration: Option<RegistrationPatch>,
    server: Option<ServerPatch>,
    tracing: Option<TracingPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPatch {
    url: Option<String>,
    basic_auth_username: Option<String>,
    basic_auth_password: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamPatch {
    endpoint: Option<String>,
    api_key: Option<String>,
    deployment: Option<String>,
    api_version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelPatch {
    bearer_token: Option<String>,
    load_test_mode: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct FeaturePatch {
    feedback_enabled: Option<bool>,
    tips_enabled: Option<bool>,
    account_link_enabled: Option<bool>,
    usage_status_enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RegistrationPatch {
    base_url: Option<String>,
    api_user: Option<String>,
    api_password: Option<String>,
    org_uuid: Option<String>,
    org_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct TracingPatch {
    enabled: Option<bool>,
    project_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
