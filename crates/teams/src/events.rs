use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::{
    activity::{Activity, ActivityKind},
    turn::{TurnError, TurnOutcome, TurnProcessor},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: String,
}

impl EventContext {
    pub fn for_activity(activity: &Activity) -> Self {
        Self { correlation_id: activity.correlation_id() }
    }
}

impl Default for EventContext {
    fn default() -> Self {
        Self { correlation_id: "unknown-correlation-id".to_owned() }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Turn(#[from] TurnError),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn kind(&self) -> ActivityKind;
    async fn handle(&self, activity: &Activity, ctx: &EventContext) -> Result<TurnOutcome, TurnError>;
}

#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<ActivityKind, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.handlers.insert(handler.kind(), Arc::new(handler));
    }

    pub async fn dispatch(
        &self,
        activity: &Activity,
        ctx: &EventContext,
    ) -> Result<TurnOutcome, DispatchError> {
        let kind = activity.kind();
        let Some(handler) = self.handlers.get(&kind) else {
            debug!(
                event_name = "dispatch.ignored",
                correlation_id = %ctx.correlation_id,
                activity_type = %activity.activity_type,
                "no handler for activity type"
            );
            return Ok(TurnOutcome::Ignored);
        };

        handler.handle(activity, ctx).await.map_err(DispatchError::from)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Message, conversation update, event and invoke handlers around one processor.
pub fn default_dispatcher(processor: Arc<TurnProcessor>) -> EventDispatcher {
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(MessageHandler::new(processor.clone()));
    dispatcher.register(ConversationUpdateHandler::new(processor.clone()));
    dispatcher.register(ActivityLogHandler::new(ActivityKind::Event, processor.clone()));
    dispatcher.register(ActivityLogHandler::new(ActivityKind::Invoke, processor));
    dispatcher
}

pub struct MessageHandler {
    processor: Arc<TurnProcessor>,
}

impl MessageHandler {
    pub fn new(processor: Arc<TurnProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl EventHandler for MessageHandler {
    fn kind(&self) -> ActivityKind {
        ActivityKind::Message
    }

    async fn handle(&self, activity: &Activity, ctx: &EventContext) -> Result<TurnOutcome, TurnError> {
        self.processor.handle_message(activity, ctx).await
    }
}

pub struct ConversationUpdateHandler {
    processor: Arc<TurnProcessor>,
}

impl ConversationUpdateHandler {
    pub fn new(processor: Arc<TurnProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl EventHandler for ConversationUpdateHandler {
    fn kind(&self) -> ActivityKind {
        ActivityKind::ConversationUpdate
    }

    async fn handle(&self, activity: &Activity, ctx: &EventContext) -> Result<TurnOutcome, TurnError> {
        if activity.members_added().is_empty() {
            return Ok(TurnOutcome::Ignored);
        }
        self.processor.handle_conversation_update(activity, ctx).await
    }
}

/// Records activities that need no reply.
pub struct ActivityLogHandler {
    kind: ActivityKind,
    processor: Arc<TurnProcessor>,
}

impl ActivityLogHandler {
    pub fn new(kind: ActivityKind, processor: Arc<TurnProcessor>) -> Self {
        Self { kind, processor }
    }
}

#[async_trait]
impl EventHandler for ActivityLogHandler {
    fn kind(&self) -> ActivityKind {
        self.kind.clone()
    }

    async fn handle(&self, activity: &Activity, ctx: &EventContext) -> Result<TurnOutcome, TurnError> {
        Ok(self.processor.log_activity(activity, ctx).await)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use courier_core::{FeedbackTracker, ManualClock};

    use super::{default_dispatcher, EventContext, EventDispatcher};
    use crate::turn::tests::{message, FixedRelay, RecordingSender};
    use crate::turn::{TurnOutcome, TurnProcessor, TurnSettings};

    fn dispatcher() -> (EventDispatcher, Arc<RecordingSender>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()));
        let sender = Arc::new(RecordingSender::default());
        let processor = TurnProcessor::new(
            Arc::new(FixedRelay::answering(json!("pong"))),
            sender.clone(),
            Arc::new(FeedbackTracker::new(clock)),
            TurnSettings { feedback_enabled: false, ..TurnSettings::default() },
        );
        (default_dispatcher(Arc::new(processor)), sender)
    }

    #[test]
    fn default_dispatcher_registers_handlers() {
        let (dispatcher, _) = dispatcher();
        assert_eq!(dispatcher.handler_count(), 4);
    }

    #[tokio::test]
    async fn dispatcher_routes_messages_to_the_processor() {
        let (dispatcher, sender) = dispatcher();
        let activity = message(json!({ "type": "message", "id": "a-1", "text": "ping", "from": { "id": "29:u" } }));

        let outcome =
            dispatcher.dispatch(&activity, &EventContext::for_activity(&activity)).await.expect("dispatch");

        assert!(matches!(outcome, TurnOutcome::Answered { .. }));
        assert_eq!(sender.texts().last().map(String::as_str), Some("pong"));
    }

    #[tokio::test]
    async fn dispatcher_returns_ignored_when_no_handler_registered() {
        let dispatcher = EventDispatcher::new();
        let activity = message(json!({ "type": "message", "text": "hello" }));

        let outcome = dispatcher.dispatch(&activity, &EventContext::default()).await.expect("dispatch");

        assert_eq!(outcome, TurnOutcome::Ignored);
    }

    #[tokio::test]
    async fn unsupported_activity_types_are_ignored() {
        let (dispatcher, sender) = dispatcher();
        let activity = message(json!({ "type": "typing" }));

        let outcome = dispatcher.dispatch(&activity, &EventContext::default()).await.expect("dispatch");

        assert_eq!(outcome, TurnOutcome::Ignored);
        assert_eq!(sender.count(), 0);
    }

    #[tokio::test]
    async fn file_consent_invoke_is_logged_without_reply() {
        let (dispatcher, sender) = dispatcher();
        let activity = message(json!({
            "type": "invoke",
            "name": "fileConsent/invoke",
            "value": { "action": "accept", "context": { "filename": "report.pdf" } }
        }));

        let outcome = dispatcher.dispatch(&activity, &EventContext::default()).await.expect("dispatch");

        assert_eq!(outcome, TurnOutcome::Logged);
        assert_eq!(sender.count(), 0);
    }

    #[tokio::test]
    async fn conversation_update_without_new_members_is_ignored() {
        let (dispatcher, sender) = dispatcher();
        let activity = message(json!({ "type": "conversationUpdate", "membersRemoved": [{ "id": "29:a" }] }));

        let outcome = dispatcher.dispatch(&activity, &EventContext::default()).await.expect("dispatch");

        assert_eq!(outcome, TurnOutcome::Ignored);
        assert_eq!(sender.count(), 0);
    }
}
