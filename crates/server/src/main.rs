mod bootstrap;
mod connector;
mod health;
mod messages;
mod proxy;
mod registration;
mod telemetry;
#[cfg(test)]
mod test_support;
mod webhook;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use courier_core::config::{AppConfig, LoadOptions};
use courier_core::{spawn_sweeper, SWEEP_INTERVAL};
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use courier_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.trim().to_ascii_lowercase()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config)?;
    let sweeper = spawn_sweeper(app.feedback.clone(), SWEEP_INTERVAL);

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    let router = bootstrap::build_router(&app);

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        address = %address,
        load_test_mode = app.load_test.is_some(),
        "courier listening"
    );

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(wait_for_shutdown())
        .await
        .context("http server failed")?;

    sweeper.abort();
    if let Some(load_test) = &app.load_test {
        tracing::info!(
            event_name = "system.server.load_test_summary",
            correlation_id = "shutdown",
            suppressed = load_test.suppressed(),
            "replies suppressed during load test"
        );
    }
    tracing::info!(event_name = "system.server.stopping", correlation_id = "shutdown", "courier stopping");

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(event_name = "system.server.signal_failed", error = %error, "ctrl-c handler failed");
    }
}
