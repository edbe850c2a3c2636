use std::path::Path;

use courier_core::config::{non_blank_secret, AppConfig, LoadOptions};
use serde::Serialize;

use super::config::redact_url;
use super::{escape_json, CommandResult, EXIT_CHECKS_FAILED};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Skipped, details: details.into() }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool, config_path: Option<&Path>) -> CommandResult {
    let report = build_report(config_path);
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { EXIT_CHECKS_FAILED };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report(config_path: Option<&Path>) -> DoctorReport {
    let options = LoadOptions { config_path: config_path.map(Path::to_path_buf), ..LoadOptions::default() };
    let mut checks = Vec::new();

    match AppConfig::load(options) {
        Ok(config) => {
            checks.push(DoctorCheck::pass("config_validation", "configuration loaded and validated"));
            checks.push(check_webhook(&config));
            checks.push(check_upstream(&config));
            checks.push(check_registration(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            for name in ["webhook_url", "upstream_api_key", "registration_readiness"] {
                checks.push(DoctorCheck::skipped(name, "skipped because configuration did not load"));
            }
        }
    }

    let any_failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let (overall_status, summary) = if any_failed {
        (CheckStatus::Fail, "doctor: one or more readiness checks failed")
    } else {
        (CheckStatus::Pass, "doctor: all readiness checks passed")
    };

    DoctorReport { overall_status, summary: summary.to_string(), checks }
}

fn check_webhook(config: &AppConfig) -> DoctorCheck {
    let url = config.webhook.url.trim();
    let auth = if config.webhook.basic_auth().is_some() { "basic auth" } else { "no auth" };
    let target = redact_url(url);

    if url.starts_with("https://") || is_local_http(url) {
        DoctorCheck::pass("webhook_url", format!("{target} ({auth}, timeout {}s)", config.webhook.timeout_secs))
    } else {
        DoctorCheck::fail("webhook_url", format!("{target} sends activities over plain http to a remote host"))
    }
}

fn check_upstream(config: &AppConfig) -> DoctorCheck {
    let endpoint = config.upstream.endpoint.as_deref().map(redact_url);
    match (non_blank_secret(config.upstream.api_key.as_ref()), endpoint) {
        (Some(_), Some(endpoint)) => DoctorCheck::pass(
            "upstream_api_key",
            format!("default key configured for {endpoint} (deployment {})", config.upstream.deployment),
        ),
        (Some(_), None) => DoctorCheck::pass(
            "upstream_api_key",
            "default key configured; callers must send an azure-endpoint header",
        ),
        (None, _) if config.upstream.api_key.is_some() => {
            DoctorCheck::fail("upstream_api_key", "upstream.api_key is set but blank")
        }
        (None, _) => DoctorCheck::skipped(
            "upstream_api_key",
            "no default key; proxy callers must send an api-key header",
        ),
    }
}

fn check_registration(config: &AppConfig) -> DoctorCheck {
    if !config.features.account_link_enabled {
        return DoctorCheck::skipped("registration_readiness", "account linking is disabled");
    }

    match config.registration.base_url.as_deref() {
        Some(base_url) if non_blank_secret(config.registration.api_password.as_ref()).is_some() => {
            DoctorCheck::pass("registration_readiness", format!("magic links issued by {}", redact_url(base_url)))
        }
        _ => DoctorCheck::fail("registration_readiness", "registration API credentials are incomplete"),
    }
}

fn is_local_http(url: &str) -> bool {
    ["http://localhost", "http://127.0.0.1", "http://[::1]"].iter().any(|prefix| url.starts_with(prefix))
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![report.summary.clone()];

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
