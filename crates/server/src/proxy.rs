//! Pass-through proxy for upstream AI completion calls.
//!
//! Only loopback and private-network callers may use it. Requests are
//! forwarded with the caller's (or the configured) `api-key`, and only an
//! allow-list of upstream headers is relayed back.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
            CONTENT_TYPE,
        },
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use reqwest::Client;
use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;
use tracing::{field, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use courier_core::config::non_blank_secret;
use courier_core::{AppConfig, ApplicationError, InterfaceError};

pub const RELAYED_HEADERS: [&str; 6] = [
    "x-ratelimit-remaining-requests",
    "x-ratelimit-limit-requests",
    "x-ratelimit-remaining-tokens",
    "x-ratelimit-limit-tokens",
    "x-ms-deployment-name",
    "x-ms-region",
];

pub const FORBIDDEN_MESSAGE: &str =
    "Access to /openai/* endpoints is restricted to localhost and Docker internal networks only";
pub const API_KEY_REQUIRED: &str =
    "API key is required. Provide via api-key header or COURIER_UPSTREAM_API_KEY";

#[derive(Clone, Debug)]
pub struct ProxySettings {
    pub endpoint: Option<String>,
    pub api_key: Option<SecretString>,
    pub deployment: String,
    pub api_version: String,
    pub tracing_enabled: bool,
    pub project_name: String,
}

impl ProxySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            endpoint: config.upstream.endpoint.clone(),
            api_key: config.upstream.api_key.clone(),
            deployment: config.upstream.deployment.clone(),
            api_version: config.upstream.api_version.clone(),
            tracing_enabled: config.tracing.enabled,
            project_name: config.tracing.project_name.clone(),
        }
    }

    /// Disabled unless tracing is configured.
    pub fn proxy_span(&self, method: &Method, path: &str, deployment: &str) -> Span {
        if !self.tracing_enabled {
            return Span::none();
        }
        info_span!(
            "llm.proxy",
            project = %self.project_name,
            method = %method,
            path,
            deployment,
            status = field::Empty,
            latency_ms = field::Empty,
            prompt_tokens = field::Empty,
            completion_tokens = field::Empty,
            total_tokens = field::Empty,
        )
    }
}

#[derive(Clone)]
pub struct ProxyState {
    client: Client,
    settings: Arc<ProxySettings>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProxyErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub correlation_id: String,
}

pub fn router(client: Client, settings: Arc<ProxySettings>) -> Router {
    Router::new().route("/openai/{*path}", any(proxy)).with_state(ProxyState { client, settings })
}

pub async fn proxy(
    State(state): State<ProxyState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = Uuid::new_v4().to_string();

    if !is_allowed_caller(peer.ip()) {
        warn!(
            event_name = "proxy.caller.blocked",
            correlation_id = %correlation_id,
            peer = %peer,
            "blocked /openai request from a non-private address"
        );
        return error_response(
            ApplicationError::CallerNotAllowed(FORBIDDEN_MESSAGE.to_owned()).into_interface(correlation_id),
        );
    }

    if method == Method::OPTIONS {
        return cors_preflight();
    }

    let settings = &state.settings;
    let Some(api_key) = header_text(&headers, "api-key")
        .or_else(|| non_blank_secret(settings.api_key.as_ref()).map(str::to_owned))
    else {
        warn!(event_name = "proxy.request.no_api_key", correlation_id = %correlation_id, "no api key available");
        return error_response(
            ApplicationError::MissingCredential(API_KEY_REQUIRED.to_owned()).into_interface(correlation_id),
        );
    };

    let Some(endpoint) = header_text(&headers, "azure-endpoint")
        .or_else(|| settings.endpoint.clone().filter(|endpoint| !endpoint.trim().is_empty()))
    else {
        return error_response(
            ApplicationError::Configuration(
                "no upstream endpoint: send an azure-endpoint header or set upstream.endpoint".to_owned(),
            )
            .into_interface(correlation_id),
        );
    };

    let target = target_url(&endpoint, &uri, &settings.api_version);
    let deployment = deployment_from_path(uri.path()).unwrap_or(&settings.deployment).to_owned();
    let span = settings.proxy_span(&method, uri.path(), &deployment);

    forward(&state.client, method, target, &api_key, body, correlation_id).instrument(span).await
}

async fn forward(
    client: &Client,
    method: Method,
    target: String,
    api_key: &str,
    body: Bytes,
    correlation_id: String,
) -> Response {
    let started = Instant::now();
    let result = client
        .request(method.clone(), &target)
        .header("api-key", api_key)
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await;

    let response = match result {
        Ok(response) => response,
        Err(error) => return transport_failure(&error, correlation_id),
    };

    let status = response.status();
    let relayed: Vec<(HeaderName, HeaderValue)> = RELAYED_HEADERS
        .iter()
        .filter_map(|name| {
            response.headers().get(*name).map(|value| (HeaderName::from_static(*name), value.clone()))
        })
        .collect();
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(error) => return transport_failure(&error, correlation_id),
    };

    let latency_ms = started.elapsed().as_millis() as u64;
    let usage = serde_json::from_slice::<Value>(&bytes).ok().and_then(|body| body.get("usage").cloned());
    record_outcome(&Span::current(), status.as_u16(), latency_ms, usage.as_ref());
    info!(
        event_name = "proxy.request.completed",
        correlation_id = %correlation_id,
        method = %method,
        status = status.as_u16(),
        latency_ms,
        "upstream call relayed"
    );

    let mut relayed_response = (status, bytes).into_response();
    let response_headers = relayed_response.headers_mut();
    response_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (name, value) in relayed {
        response_headers.insert(name, value);
    }
    relayed_response
}

/// Records status, latency and token usage on an upstream call span.
pub fn record_outcome(span: &Span, status: u16, latency_ms: u64, usage: Option<&Value>) {
    span.record("status", status);
    span.record("latency_ms", latency_ms);
    let Some(usage) = usage else {
        return;
    };
    for key in ["prompt_tokens", "completion_tokens", "total_tokens"] {
        if let Some(tokens) = usage.get(key).and_then(Value::as_u64) {
            span.record(key, tokens);
        }
    }
}

/// Loopback or private network, with IPv4-mapped IPv6 addresses unwrapped.
pub fn is_allowed_caller(ip: IpAddr) -> bool {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

pub fn target_url(endpoint: &str, uri: &Uri, api_version: &str) -> String {
    let path_and_query = uri.path_and_query().map(|value| value.as_str()).unwrap_or_else(|| uri.path());
    let mut target = format!("{}{}", endpoint.trim().trim_end_matches('/'), path_and_query);
    if !target.contains("api-version=") {
        target.push(if target.contains('?') { '&' } else { '?' });
        target.push_str("api-version=");
        target.push_str(api_version);
    }
    target
}

fn deployment_from_path(path: &str) -> Option<&str> {
    let mut segments = path.split('/');
    segments.find(|segment| *segment == "deployments")?;
    segments.next().filter(|deployment| !deployment.is_empty())
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn cors_preflight() -> Response {
    (
        StatusCode::OK,
        [
            (ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, PUT, PATCH, DELETE, OPTIONS"),
            (ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type, api-key, azure-endpoint"),
        ],
    )
        .into_response()
}

fn transport_failure(error: &reqwest::Error, correlation_id: String) -> Response {
    record_outcome(&Span::current(), 500, 0, None);
    warn!(
        event_name = "proxy.request.failed",
        correlation_id = %correlation_id,
        error = %error,
        "upstream call failed"
    );
    error_response(InterfaceError::Internal { message: error.to_string(), correlation_id })
}

fn error_response(error: InterfaceError) -> Response {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match &error {
        InterfaceError::Forbidden { message, correlation_id } => ProxyErrorBody {
            error: "Forbidden".to_owned(),
            message: Some(message.clone()),
            correlation_id: correlation_id.clone(),
        },
        InterfaceError::BadRequest { message, correlation_id } => {
            ProxyErrorBody { error: message.clone(), message: None, correlation_id: correlation_id.clone() }
        }
        InterfaceError::Internal { message, correlation_id } => ProxyErrorBody {
            error: "Proxy error".to_owned(),
            message: Some(message.clone()),
            correlation_id: correlation_id.clone(),
        },
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body, Bytes},
        extract::{ConnectInfo, State},
        http::{HeaderMap, Method, Request, StatusCode, Uri},
        routing::any,
        Json, Router,
    };
    use reqwest::Client;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{is_allowed_caller, router, target_url, ProxySettings, API_KEY_REQUIRED, FORBIDDEN_MESSAGE};
    use crate::test_support::spawn_mock;

    const COMPLETIONS: &str = "/openai/deployments/gpt-4.1/chat/completions";

    async fn upstream(hits: Arc<AtomicUsize>) -> String {
        spawn_mock(
            Router::new()
                .route(
                    "/openai/{*path}",
                    any(|State(hits): State<Arc<AtomicUsize>>, uri: Uri, headers: HeaderMap, body: Bytes| async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let echo = json!({
                            "query": uri.query(),
                            "apiKey": headers.get("api-key").and_then(|value| value.to_str().ok()),
                            "body": String::from_utf8_lossy(&body),
                            "usage": { "prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5 }
                        });
                        (
                            StatusCode::CREATED,
                            [
                                ("x-ratelimit-remaining-requests", "99"),
                                ("x-ms-region", "westeurope"),
                                ("x-internal-trace", "hidden"),
                            ],
                            Json(echo),
                        )
                    }),
                )
                .with_state(hits),
        )
        .await
    }

    fn settings(endpoint: Option<String>, api_key: Option<&str>) -> Arc<ProxySettings> {
        Arc::new(ProxySettings {
            endpoint,
            api_key: api_key.map(|key| key.to_owned().into()),
            deployment: "gpt-4.1".to_owned(),
            api_version: "2024-12-01-preview".to_owned(),
            tracing_enabled: true,
            project_name: "courier-tests".to_owned(),
        })
    }

    fn request(method: Method, uri: &str, peer: IpAddr) -> axum::http::request::Builder {
        Request::builder().method(method).uri(uri).extension(ConnectInfo(SocketAddr::new(peer, 40000)))
    }

    fn loopback() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[test]
    fn caller_guard_allows_loopback_and_private_ranges_only() {
        assert!(is_allowed_caller(loopback()));
        assert!(is_allowed_caller(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_allowed_caller("::ffff:127.0.0.1".parse().expect("ip")));
        assert!(is_allowed_caller("::ffff:172.18.0.1".parse().expect("ip")));
        assert!(is_allowed_caller("172.31.255.1".parse().expect("ip")));
        assert!(is_allowed_caller("10.0.0.7".parse().expect("ip")));
        assert!(is_allowed_caller("192.168.1.20".parse().expect("ip")));
        assert!(!is_allowed_caller("172.32.0.1".parse().expect("ip")));
        assert!(!is_allowed_caller("203.0.113.9".parse().expect("ip")));
        assert!(!is_allowed_caller("2001:db8::1".parse().expect("ip")));
    }

    #[test]
    fn api_version_is_appended_only_when_absent() {
        let plain: Uri = COMPLETIONS.parse().expect("uri");
        let with_query: Uri = format!("{COMPLETIONS}?stream=false").parse().expect("uri");
        let pinned: Uri = format!("{COMPLETIONS}?api-version=2024-02-01").parse().expect("uri");

        assert_eq!(
            target_url("https://oai.example.com/", &plain, "v1"),
            format!("https://oai.example.com{COMPLETIONS}?api-version=v1")
        );
        assert_eq!(
            target_url("https://oai.example.com", &with_query, "v1"),
            format!("https://oai.example.com{COMPLETIONS}?stream=false&api-version=v1")
        );
        assert_eq!(
            target_url("https://oai.example.com", &pinned, "v1"),
            format!("https://oai.example.com{COMPLETIONS}?api-version=2024-02-01")
        );
    }

    #[tokio::test]
    async fn remote_callers_are_forbidden_and_never_forwarded() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = upstream(hits.clone()).await;
        let app = router(Client::new(), settings(Some(base), Some("key")));

        let response = app
            .oneshot(
                request(Method::POST, COMPLETIONS, "203.0.113.9".parse().expect("ip"))
                    .body(Body::from("{}"))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Forbidden");
        assert_eq!(body["message"], FORBIDDEN_MESSAGE);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_api_key_is_rejected_without_upstream_calls() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = upstream(hits.clone()).await;
        let app = router(Client::new(), settings(Some(base), None));

        let response = app
            .oneshot(request(Method::POST, COMPLETIONS, loopback()).body(Body::from("{}")).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], API_KEY_REQUIRED);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn forwards_request_and_relays_allow_listed_headers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = upstream(hits.clone()).await;
        let app = router(Client::new(), settings(Some(base), Some("configured-key")));

        let response = app
            .oneshot(
                request(Method::POST, COMPLETIONS, loopback())
                    .header("api-key", "caller-key")
                    .body(Body::from(r#"{"messages":[]}"#))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-ratelimit-remaining-requests"], "99");
        assert_eq!(response.headers()["x-ms-region"], "westeurope");
        assert!(response.headers().get("x-internal-trace").is_none());
        assert_eq!(response.headers()["content-type"], "application/json");

        let body = json_body(response).await;
        assert_eq!(body["apiKey"], "caller-key");
        assert_eq!(body["query"], "api-version=2024-12-01-preview");
        assert_eq!(body["body"], r#"{"messages":[]}"#);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn endpoint_header_overrides_configured_endpoint() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = upstream(hits.clone()).await;
        let app = router(Client::new(), settings(Some("http://127.0.0.1:9".to_owned()), Some("key")));

        let response = app
            .oneshot(
                request(Method::GET, "/openai/models", loopback())
                    .header("azure-endpoint", base)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn preflight_is_answered_locally() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = upstream(hits.clone()).await;
        let app = router(Client::new(), settings(Some(base), None));

        let response = app
            .oneshot(request(Method::OPTIONS, COMPLETIONS, loopback()).body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_proxy_error() {
        let app = router(Client::new(), settings(Some("http://127.0.0.1:9".to_owned()), Some("key")));

        let response = app
            .oneshot(request(Method::POST, COMPLETIONS, loopback()).body(Body::from("{}")).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Proxy error");
        assert!(body["message"].as_str().is_some_and(|message| !message.is_empty()));
    }
}
