//! Inbound activity endpoint, over plain HTTP and over a websocket.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::Response,
    routing::post,
    Json, Router,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use courier_teams::{Activity, EventContext, EventDispatcher, TurnOutcome};

#[derive(Clone)]
pub struct MessagesState {
    dispatcher: Arc<EventDispatcher>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageError {
    pub error: &'static str,
    pub message: String,
    pub correlation_id: String,
}

/// Reply frame sent back for every websocket text frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameAck {
    pub status: &'static str,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn router(dispatcher: Arc<EventDispatcher>) -> Router {
    Router::new()
        .route("/api/messages", post(receive).get(upgrade))
        .with_state(MessagesState { dispatcher })
}

pub async fn receive(
    State(state): State<MessagesState>,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, Json<MessageError>)> {
    let activity = decode(&body).map_err(|message| {
        (
            StatusCode::BAD_REQUEST,
            Json(MessageError {
                error: "Invalid activity",
                message,
                correlation_id: EventContext::default().correlation_id,
            }),
        )
    })?;

    let ctx = EventContext::for_activity(&activity);
    match dispatch(&state.dispatcher, &activity, &ctx).await {
        Ok(_) => Ok(StatusCode::OK),
        Err(message) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(MessageError { error: "Activity processing failed", message, correlation_id: ctx.correlation_id }),
        )),
    }
}

pub async fn upgrade(State(state): State<MessagesState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: MessagesState) {
    info!(event_name = "messages.socket.opened", "activity websocket connected");

    while let Some(Ok(message)) = socket.recv().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let ack = process_frame(&state.dispatcher, text.as_str()).await;
        let Ok(encoded) = serde_json::to_string(&ack) else {
            continue;
        };
        if socket.send(Message::Text(encoded.into())).await.is_err() {
            break;
        }
    }

    info!(event_name = "messages.socket.closed", "activity websocket disconnected");
}

/// Processes one websocket text frame exactly like a POSTed activity.
pub async fn process_frame(dispatcher: &EventDispatcher, text: &str) -> FrameAck {
    let activity = match decode(text.as_bytes()) {
        Ok(activity) => activity,
        Err(message) => {
            return FrameAck {
                status: "rejected",
                correlation_id: EventContext::default().correlation_id,
                message: Some(message),
            }
        }
    };

    let ctx = EventContext::for_activity(&activity);
    match dispatch(dispatcher, &activity, &ctx).await {
        Ok(_) => FrameAck { status: "processed", correlation_id: ctx.correlation_id, message: None },
        Err(message) => FrameAck { status: "failed", correlation_id: ctx.correlation_id, message: Some(message) },
    }
}

fn decode(body: &[u8]) -> Result<Activity, String> {
    serde_json::from_slice::<Activity>(body).map_err(|error| {
        warn!(event_name = "messages.activity.invalid", error = %error, "rejected undecodable activity");
        error.to_string()
    })
}

async fn dispatch(dispatcher: &EventDispatcher, activity: &Activity, ctx: &EventContext) -> Result<TurnOutcome, String> {
    info!(
        event_name = "messages.activity.received",
        correlation_id = %ctx.correlation_id,
        activity_type = %activity.activity_type,
        "activity received"
    );

    match dispatcher.dispatch(activity, ctx).await {
        Ok(outcome) => {
            debug!(
                event_name = "messages.activity.processed",
                correlation_id = %ctx.correlation_id,
                outcome = ?outcome,
                "activity processed"
            );
            Ok(outcome)
        }
        Err(dispatch_error) => {
            error!(
                event_name = "messages.activity.failed",
                correlation_id = %ctx.correlation_id,
                error = %dispatch_error,
                "activity processing failed"
            );
            Err(dispatch_error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use courier_teams::events::EventHandler;
    use courier_teams::{
        Activity, ActivityKind, EventContext, EventDispatcher, SendError, TurnError, TurnOutcome,
    };

    use super::{process_frame, router};

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn kind(&self) -> ActivityKind {
            ActivityKind::Message
        }

        async fn handle(&self, _activity: &Activity, _ctx: &EventContext) -> Result<TurnOutcome, TurnError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SendError("connector down".to_owned()).into());
            }
            Ok(TurnOutcome::Logged)
        }
    }

    fn dispatcher(calls: Arc<AtomicUsize>, fail: bool) -> Arc<EventDispatcher> {
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register(CountingHandler { calls, fail });
        Arc::new(dispatcher)
    }

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/api/messages")
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .expect("request")
    }

    #[tokio::test]
    async fn posted_activity_is_dispatched_and_acknowledged() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = router(dispatcher(calls.clone(), false));

        let response = app
            .oneshot(post(r#"{"type":"message","id":"act-9","text":"hello"}"#))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        assert!(body.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn undecodable_body_is_a_bad_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = router(dispatcher(calls.clone(), false));

        let response = app.oneshot(post("not json")).await.expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(body["error"], "Invalid activity");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_failure_is_a_server_error() {
        let app = router(dispatcher(Arc::new(AtomicUsize::new(0)), true));

        let response = app.oneshot(post(r#"{"type":"message","id":"act-10"}"#)).await.expect("response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(body["correlationId"], "act-10");
    }

    #[tokio::test]
    async fn unhandled_activity_types_are_still_acknowledged() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = router(dispatcher(calls.clone(), false));

        let response = app.oneshot(post(r#"{"type":"typing","id":"act-11"}"#)).await.expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn websocket_frames_are_processed_like_posts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher(calls.clone(), false);

        let processed = process_frame(&dispatcher, &json!({ "type": "message", "id": "f-1" }).to_string()).await;
        let rejected = process_frame(&dispatcher, "{").await;

        assert_eq!(processed.status, "processed");
        assert_eq!(processed.correlation_id, "f-1");
        assert_eq!(rejected.status, "rejected");
        assert!(rejected.message.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
