use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use courier_core::config::{non_blank_secret, AppConfig, LoadOptions};
use secrecy::SecretString;
use toml::Value;

use super::{CommandResult, EXIT_CONFIG_INVALID};

struct Field {
    key: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

impl Field {
    fn new(key: &'static str, env_keys: &'static [&'static str], value: impl Into<String>) -> Self {
        Self { key, env_keys, value: value.into() }
    }
}

pub fn run(config_path: Option<&Path>) -> CommandResult {
    let options = LoadOptions { config_path: config_path.map(Path::to_path_buf), ..LoadOptions::default() };
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure("config", "config_validation", error.to_string(), EXIT_CONFIG_INVALID)
        }
    };

    let file_path = detect_config_path(config_path);
    let file_doc = load_config_file_doc(file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(
        fields(&config)
            .into_iter()
            .map(|field| {
                let source = field_source(&field, file_doc.as_ref(), file_path.as_deref());
                format!("- {} = {} (source: {source})", field.key, field.value)
            }),
    );

    CommandResult::success(lines.join("\n"))
}

fn fields(config: &AppConfig) -> Vec<Field> {
    vec![
        Field::new("webhook.url", &["COURIER_WEBHOOK_URL"], redact_url(&config.webhook.url)),
        Field::new(
            "webhook.basic_auth_username",
            &["COURIER_WEBHOOK_BASIC_AUTH_USERNAME"],
            config.webhook.basic_auth_username.as_deref().unwrap_or("<unset>"),
        ),
        Field::new(
            "webhook.basic_auth_password",
            &["COURIER_WEBHOOK_BASIC_AUTH_PASSWORD"],
            redact_secret(config.webhook.basic_auth_password.as_ref()),
        ),
        Field::new(
            "webhook.timeout_secs",
            &["COURIER_WEBHOOK_TIMEOUT_SECS"],
            config.webhook.timeout_secs.to_string(),
        ),
        Field::new(
            "upstream.endpoint",
            &["COURIER_UPSTREAM_ENDPOINT"],
            config.upstream.endpoint.as_deref().unwrap_or("<unset>"),
        ),
        Field::new(
            "upstream.api_key",
            &["COURIER_UPSTREAM_API_KEY"],
            redact_secret(config.upstream.api_key.as_ref()),
        ),
        Field::new("upstream.deployment", &["COURIER_UPSTREAM_DEPLOYMENT"], config.upstream.deployment.as_str()),
        Field::new("upstream.api_version", &["COURIER_UPSTREAM_API_VERSION"], config.upstream.api_version.as_str()),
        Field::new(
            "channel.bearer_token",
            &["COURIER_CHANNEL_BEARER_TOKEN"],
            redact_secret(config.channel.bearer_token.as_ref()),
        ),
        Field::new(
            "channel.load_test_mode",
            &["COURIER_CHANNEL_LOAD_TEST_MODE"],
            config.channel.load_test_mode.to_string(),
        ),
        Field::new(
            "features.feedback_enabled",
            &["COURIER_FEATURES_FEEDBACK_ENABLED"],
            config.features.feedback_enabled.to_string(),
        ),
        Field::new(
            "features.tips_enabled",
            &["COURIER_FEATURES_TIPS_ENABLED"],
            config.features.tips_enabled.to_string(),
        ),
        Field::new(
            "features.account_link_enabled",
            &["COURIER_FEATURES_ACCOUNT_LINK_ENABLED"],
            config.features.account_link_enabled.to_string(),
        ),
        Field::new(
            "features.usage_status_enabled",
            &["COURIER_FEATURES_USAGE_STATUS_ENABLED"],
            config.features.usage_status_enabled.to_string(),
        ),
        Field::new(
            "registration.base_url",
            &["COURIER_REGISTRATION_BASE_URL"],
            config.registration.base_url.as_deref().unwrap_or("<unset>"),
        ),
        Field::new(
            "registration.api_user",
            &["COURIER_REGISTRATION_API_USER"],
            config.registration.api_user.as_deref().unwrap_or("<unset>"),
        ),
        Field::new(
            "registration.api_password",
            &["COURIER_REGISTRATION_API_PASSWORD"],
            redact_secret(config.registration.api_password.as_ref()),
        ),
        Field::new(
            "registration.org_uuid",
            &["COURIER_REGISTRATION_ORG_UUID"],
            config.registration.org_uuid.as_deref().unwrap_or("<unset>"),
        ),
        Field::new("server.bind_address", &["COURIER_SERVER_BIND_ADDRESS"], config.server.bind_address.as_str()),
        Field::new("server.port", &["COURIER_SERVER_PORT"], config.server.port.to_string()),
        Field::new("tracing.enabled", &["COURIER_TRACING_ENABLED"], config.tracing.enabled.to_string()),
        Field::new(
            "tracing.project_name",
            &["COURIER_TRACING_PROJECT_NAME"],
            config.tracing.project_name.as_str(),
        ),
        Field::new(
            "logging.level",
            &["COURIER_LOGGING_LEVEL", "COURIER_LOG_LEVEL"],
            config.logging.level.as_str(),
        ),
        Field::new(
            "logging.format",
            &["COURIER_LOGGING_FORMAT", "COURIER_LOG_FORMAT"],
            format!("{:?}", config.logging.format).to_ascii_lowercase(),
        ),
    ]
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    [PathBuf::from("courier.toml"), PathBuf::from("config/courier.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(field: &Field, file_doc: Option<&Value>, file_path: Option<&Path>) -> String {
    if let Some(env_key) = field.env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = file_doc {
        if contains_path(doc, field.key) {
            let file_path =
                file_path.map(|path| path.display().to_string()).unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn redact_secret(secret: Option<&SecretString>) -> &'static str {
    match (secret, non_blank_secret(secret)) {
        (None, _) => "<unset>",
        (Some(_), None) => "<empty>",
        (Some(_), Some(_)) => "<redacted>",
    }
}

/// Keeps scheme and host; workflow webhook paths usually embed a shared secret.
pub(crate) fn redact_url(url: &str) -> String {
    let trimmed = url.trim();
    let Some((scheme, rest)) = trimmed.split_once("://") else {
        return "<redacted>".to_string();
    };
    match rest.split_once('/') {
        Some((host, path)) if !path.is_empty() => format!("{scheme}://{host}/***"),
        _ => format!("{scheme}://{}", rest.trim_end_matches('/')),
    }
}
