use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

pub const SERVICE_NAME: &str = "courier";

#[derive(Clone)]
pub struct HealthState {
    port: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub service: &'static str,
    pub port: u16,
}

pub fn router(port: u16) -> Router {
    Router::new().route("/api/health", get(health)).with_state(HealthState { port })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let payload = HealthResponse {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339(),
        service: SERVICE_NAME,
        port: state.port,
    };

    (StatusCode::OK, Json(payload))
}
