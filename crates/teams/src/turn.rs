//! One conversational turn: relay a message to the workflow and answer the user.
//!
//! Collaborators sit behind traits so the server wires real HTTP clients and
//! tests wire in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use courier_core::config::FeatureConfig;
use courier_core::{unwrap_output, AppConfig, DeliveryFailure, FeedbackTracker};

use crate::activity::Activity;
use crate::enrich::{self, ExtendedIdentity};
use crate::events::EventContext;
use crate::messages::{self, FeedbackSubmission, OutgoingActivity, NO_RESPONSE_TEXT};

pub const FILE_CONSENT_EVENT: &str = "fileConsent/invoke";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("activity send failed: {0}")]
pub struct SendError(pub String);

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

#[async_trait]
pub trait WorkflowRelay: Send + Sync {
    /// Posts the enriched payload and returns the normalized `output`, or
    /// `None` when the workflow answered without one.
    async fn relay(&self, payload: &Value, ctx: &EventContext) -> Result<Option<Value>, DeliveryFailure>;
}

#[async_trait]
pub trait ActivitySender: Send + Sync {
    async fn send(&self, inbound: &Activity, reply: OutgoingActivity) -> Result<(), SendError>;
}

#[async_trait]
pub trait AccountLinkProvider: Send + Sync {
    async fn magic_link(&self, activity: &Activity) -> anyhow::Result<String>;
}

#[async_trait]
pub trait IdentityLookup: Send + Sync {
    async fn lookup(&self, activity: &Activity) -> anyhow::Result<ExtendedIdentity>;
}

#[derive(Default)]
pub struct NoopAccountLinkProvider;

#[async_trait]
impl AccountLinkProvider for NoopAccountLinkProvider {
    async fn magic_link(&self, _activity: &Activity) -> anyhow::Result<String> {
        anyhow::bail!("account linking is not configured")
    }
}

#[derive(Default)]
pub struct NoopIdentityLookup;

#[async_trait]
impl IdentityLookup for NoopIdentityLookup {
    async fn lookup(&self, _activity: &Activity) -> anyhow::Result<ExtendedIdentity> {
        Ok(ExtendedIdentity::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TurnSettings {
    pub feedback_enabled: bool,
    pub tips_enabled: bool,
    pub account_link_enabled: bool,
    pub usage_status_enabled: bool,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default().features)
    }
}

impl From<&FeatureConfig> for TurnSettings {
    fn from(features: &FeatureConfig) -> Self {
        Self {
            feedback_enabled: features.feedback_enabled,
            tips_enabled: features.tips_enabled,
            account_link_enabled: features.account_link_enabled,
            usage_status_enabled: features.usage_status_enabled,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    FeedbackRecorded { rating: Option<u8> },
    Answered { attachment: bool, feedback_prompted: bool },
    DeliveryFailed(DeliveryFailure),
    Welcomed { members: usize },
    Logged,
    Ignored,
}

pub struct TurnProcessor {
    relay: Arc<dyn WorkflowRelay>,
    sender: Arc<dyn ActivitySender>,
    feedback: Arc<FeedbackTracker>,
    identity: Arc<dyn IdentityLookup>,
    account_link: Arc<dyn AccountLinkProvider>,
    settings: TurnSettings,
}

impl TurnProcessor {
    pub fn new(
        relay: Arc<dyn WorkflowRelay>,
        sender: Arc<dyn ActivitySender>,
        feedback: Arc<FeedbackTracker>,
        settings: TurnSettings,
    ) -> Self {
        Self {
            relay,
            sender,
            feedback,
            identity: Arc::new(NoopIdentityLookup),
            account_link: Arc::new(NoopAccountLinkProvider),
            settings,
        }
    }

    pub fn with_identity_lookup(mut self, identity: Arc<dyn IdentityLookup>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_account_link(mut self, account_link: Arc<dyn AccountLinkProvider>) -> Self {
        self.account_link = account_link;
        self
    }

    pub fn feedback(&self) -> &Arc<FeedbackTracker> {
        &self.feedback
    }

    pub async fn handle_message(
        &self,
        activity: &Activity,
        ctx: &EventContext,
    ) -> Result<TurnOutcome, TurnError> {
        let user_id = activity.user_id().unwrap_or_default();

        if let Some(submission) = activity.value.as_ref().and_then(FeedbackSubmission::from_value) {
            self.feedback.mark_given(user_id, submission.rating).await;
            info!(
                event_name = "turn.feedback.recorded",
                correlation_id = %ctx.correlation_id,
                rating = submission.rating,
                "feedback submission recorded"
            );
            self.sender.send(activity, messages::feedback_acknowledgement(submission)).await?;
            return Ok(TurnOutcome::FeedbackRecorded { rating: submission.rating });
        }

        self.sender.send(activity, messages::thinking_message()).await?;

        let identity = match self.identity.lookup(activity).await {
            Ok(identity) => Some(identity),
            Err(error) => {
                warn!(
                    event_name = "turn.identity.lookup_failed",
                    correlation_id = %ctx.correlation_id,
                    error = %error,
                    "extended identity lookup failed; email omitted"
                );
                None
            }
        };
        let payload = enrich::build_payload(activity, identity.as_ref())?;

        let output = match self.relay.relay(&payload, ctx).await {
            Ok(output) => output,
            Err(failure) => {
                warn!(
                    event_name = "turn.relay.failed",
                    correlation_id = %ctx.correlation_id,
                    failure = failure.label(),
                    "workflow relay failed"
                );
                self.sender.send(activity, messages::ReplyBuilder::new().text(failure.user_message()).build()).await?;
                return Ok(TurnOutcome::DeliveryFailed(failure));
            }
        };

        let (text, attachment_url) = match output {
            Some(output) => unwrap_output(&output).into_parts(),
            None => (String::new(), None),
        };
        let text = if text.trim().is_empty() { NO_RESPONSE_TEXT.to_owned() } else { text };
        let attachment = attachment_url.is_some();
        self.sender.send(activity, messages::agent_reply(text, attachment_url.as_deref())).await?;

        if enrich::is_personal_conversation(activity) {
            self.send_personal_additions(activity, ctx).await?;
        }

        let feedback_prompted = self.settings.feedback_enabled && self.feedback.should_prompt(user_id).await;
        if feedback_prompted {
            self.sender.send(activity, messages::feedback_prompt_card()).await?;
            self.feedback.mark_prompted(user_id).await;
        } else {
            self.feedback.mark_interaction(user_id).await;
        }

        info!(
            event_name = "turn.message.answered",
            correlation_id = %ctx.correlation_id,
            attachment,
            feedback_prompted,
            "message answered"
        );
        Ok(TurnOutcome::Answered { attachment, feedback_prompted })
    }

    async fn send_personal_additions(&self, activity: &Activity, ctx: &EventContext) -> Result<(), TurnError> {
        if self.settings.tips_enabled {
            let has_files = !enrich::detect_file_urls(activity.text()).is_empty();
            let tip = messages::contextual_tip(has_files, enrich::is_thread_reply(activity));
            self.sender.send(activity, messages::tip_message(tip)).await?;
        }

        if self.settings.account_link_enabled {
            match self.account_link.magic_link(activity).await {
                Ok(link) => self.sender.send(activity, messages::account_link_card(&link)).await?,
                Err(error) => warn!(
                    event_name = "turn.account_link.skipped",
                    correlation_id = %ctx.correlation_id,
                    error = %error,
                    "magic link unavailable; account link card skipped"
                ),
            }
        }

        if self.settings.usage_status_enabled {
            let record = self.feedback.status(activity.user_id().unwrap_or_default()).await;
            self.sender.send(activity, messages::usage_status_message(record.as_ref())).await?;
        }

        Ok(())
    }

    /// Welcomes every added member except the bot itself.
    pub async fn handle_conversation_update(
        &self,
        activity: &Activity,
        ctx: &EventContext,
    ) -> Result<TurnOutcome, TurnError> {
        let bot_id = activity.recipient.as_ref().and_then(|recipient| recipient.id.as_deref());
        let mut members = 0;
        for member in activity.members_added() {
            if member.id.as_deref() == bot_id {
                continue;
            }
            self.sender.send(activity, messages::welcome_message()).await?;
            members += 1;
        }

        debug!(
            event_name = "turn.members_added",
            correlation_id = %ctx.correlation_id,
            members,
            "conversation update handled"
        );
        Ok(if members == 0 { TurnOutcome::Ignored } else { TurnOutcome::Welcomed { members } })
    }

    pub async fn log_activity(&self, activity: &Activity, ctx: &EventContext) -> TurnOutcome {
        let name = activity.name.as_deref().unwrap_or_default();
        if name == FILE_CONSENT_EVENT {
            info!(
                event_name = "turn.file_consent",
                correlation_id = %ctx.correlation_id,
                value = ?activity.value,
                "file consent activity received"
            );
        } else {
            info!(
                event_name = "turn.activity.logged",
                correlation_id = %ctx.correlation_id,
                activity_type = %activity.activity_type,
                name,
                "non-message activity received"
            );
        }
        TurnOutcome::Logged
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};

    use courier_core::{DeliveryFailure, FeedbackTracker, ManualClock};

    use super::{
        AccountLinkProvider, ActivitySender, SendError, TurnOutcome, TurnProcessor, TurnSettings,
        WorkflowRelay,
    };
    use crate::activity::Activity;
    use crate::events::EventContext;
    use crate::messages::{OutgoingActivity, NO_RESPONSE_TEXT, THINKING_TEXT, WELCOME_TEXT};

    pub(crate) struct FixedRelay {
        pub response: Result<Option<Value>, DeliveryFailure>,
        pub payloads: Mutex<Vec<Value>>,
    }

    impl FixedRelay {
        pub(crate) fn answering(output: Value) -> Self {
            Self { response: Ok(Some(output)), payloads: Mutex::new(Vec::new()) }
        }

        pub(crate) fn failing(failure: DeliveryFailure) -> Self {
            Self { response: Err(failure), payloads: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl WorkflowRelay for FixedRelay {
        async fn relay(
            &self,
            payload: &Value,
            _ctx: &EventContext,
        ) -> Result<Option<Value>, DeliveryFailure> {
            self.payloads.lock().expect("lock").push(payload.clone());
            self.response.clone()
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingSender {
        pub sent: Mutex<Vec<OutgoingActivity>>,
    }

    impl RecordingSender {
        pub(crate) fn texts(&self) -> Vec<String> {
            self.sent.lock().expect("lock").iter().map(|reply| reply.text().to_owned()).collect()
        }

        pub(crate) fn count(&self) -> usize {
            self.sent.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl ActivitySender for RecordingSender {
        async fn send(&self, _inbound: &Activity, reply: OutgoingActivity) -> Result<(), SendError> {
            self.sent.lock().expect("lock").push(reply);
            Ok(())
        }
    }

    struct StaticLink;

    #[async_trait]
    impl AccountLinkProvider for StaticLink {
        async fn magic_link(&self, _activity: &Activity) -> anyhow::Result<String> {
            Ok("https://app.example.com/auth/magic-link?token=t".to_owned())
        }
    }

    pub(crate) fn message(value: Value) -> Activity {
        serde_json::from_value(value).expect("activity should deserialize")
    }

    fn personal_message(text: &str) -> Activity {
        message(json!({
            "type": "message",
            "id": "act-1",
            "text": text,
            "from": { "id": "29:u", "aadObjectId": "aad-1", "name": "Ada" },
            "recipient": { "id": "28:bot" },
            "conversation": { "id": "conv-1", "conversationType": "personal" }
        }))
    }

    fn tracker() -> Arc<FeedbackTracker> {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()));
        Arc::new(FeedbackTracker::new(clock))
    }

    fn processor(relay: FixedRelay, settings: TurnSettings) -> (TurnProcessor, Arc<RecordingSender>, Arc<FixedRelay>) {
        let relay = Arc::new(relay);
        let sender = Arc::new(RecordingSender::default());
        let processor = TurnProcessor::new(relay.clone(), sender.clone(), tracker(), settings);
        (processor, sender, relay)
    }

    fn quiet() -> TurnSettings {
        TurnSettings {
            feedback_enabled: false,
            tips_enabled: false,
            account_link_enabled: false,
            usage_status_enabled: false,
        }
    }

    #[tokio::test]
    async fn message_is_relayed_and_unwrapped_reply_sent() {
        let inner = json!({ "output": "Y", "attachment": "http://a" }).to_string();
        let (processor, sender, relay) = processor(FixedRelay::answering(json!(inner)), quiet());

        let outcome = processor
            .handle_message(&personal_message("hello"), &EventContext::default())
            .await
            .expect("turn");

        assert_eq!(outcome, TurnOutcome::Answered { attachment: true, feedback_prompted: false });
        assert_eq!(sender.texts(), vec![THINKING_TEXT.to_owned(), "Y".to_owned()]);
        let sent = sender.sent.lock().expect("lock");
        assert_eq!(sent[1].attachments[0].content_url.as_deref(), Some("http://a"));

        let payloads = relay.payloads.lock().expect("lock");
        assert_eq!(payloads[0]["text"], "hello");
        assert_eq!(payloads[0]["custom"]["user"]["id"], "aad-1");
    }

    #[tokio::test]
    async fn missing_output_falls_back_to_fixed_text() {
        let relay = FixedRelay { response: Ok(None), payloads: Default::default() };
        let (processor, sender, _) = processor(relay, quiet());

        processor.handle_message(&personal_message("hi"), &EventContext::default()).await.expect("turn");

        assert_eq!(sender.texts()[1], NO_RESPONSE_TEXT);
    }

    #[tokio::test]
    async fn relay_failure_sends_the_class_message_and_stops() {
        let (processor, sender, _) =
            processor(FixedRelay::failing(DeliveryFailure::RateLimited), TurnSettings::default());

        let outcome =
            processor.handle_message(&personal_message("hi"), &EventContext::default()).await.expect("turn");

        assert_eq!(outcome, TurnOutcome::DeliveryFailed(DeliveryFailure::RateLimited));
        assert_eq!(
            sender.texts(),
            vec![THINKING_TEXT.to_owned(), DeliveryFailure::RateLimited.user_message().to_owned()]
        );
        assert!(processor.feedback().is_empty().await);
    }

    #[tokio::test]
    async fn first_answer_of_the_day_prompts_for_feedback_once() {
        let settings = TurnSettings { feedback_enabled: true, ..quiet() };
        let (processor, sender, _) = processor(FixedRelay::answering(json!("ok")), settings);
        let activity = personal_message("hi");

        let first = processor.handle_message(&activity, &EventContext::default()).await.expect("turn");
        let second = processor.handle_message(&activity, &EventContext::default()).await.expect("turn");

        assert_eq!(first, TurnOutcome::Answered { attachment: false, feedback_prompted: true });
        assert_eq!(second, TurnOutcome::Answered { attachment: false, feedback_prompted: false });
        let cards = sender.sent.lock().expect("lock").iter().filter(|reply| reply.has_card()).count();
        assert_eq!(cards, 1);
    }

    #[tokio::test]
    async fn feedback_submission_is_recorded_without_relaying() {
        let (processor, sender, relay) = processor(FixedRelay::answering(json!("unused")), quiet());
        let mut activity = personal_message("");
        activity.value = Some(json!({ "action": "feedback", "rating": 4 }));

        let outcome = processor.handle_message(&activity, &EventContext::default()).await.expect("turn");

        assert_eq!(outcome, TurnOutcome::FeedbackRecorded { rating: Some(4) });
        assert!(relay.payloads.lock().expect("lock").is_empty());
        assert_eq!(sender.count(), 1);
        let record = processor.feedback().status("aad-1").await.expect("record");
        assert_eq!(record.rating, Some(4));
        assert!(record.feedback_given);
    }

    #[tokio::test]
    async fn personal_additions_follow_the_feature_switches() {
        let settings = TurnSettings {
            feedback_enabled: false,
            tips_enabled: true,
            account_link_enabled: true,
            usage_status_enabled: true,
        };
        let (processor, sender, _) = processor(FixedRelay::answering(json!("ok")), settings);
        let processor = processor.with_account_link(Arc::new(StaticLink));

        processor.handle_message(&personal_message("hi"), &EventContext::default()).await.expect("turn");

        let texts = sender.texts();
        assert_eq!(sender.count(), 5);
        assert!(texts[2].starts_with("💡 Tip:"));
        assert!(sender.sent.lock().expect("lock")[3].has_card());
        assert!(texts[4].starts_with("Usage status:"));
    }

    #[tokio::test]
    async fn failed_magic_link_skips_only_the_card() {
        let settings = TurnSettings { account_link_enabled: true, ..quiet() };
        let (processor, sender, _) = processor(FixedRelay::answering(json!("ok")), settings);

        let outcome =
            processor.handle_message(&personal_message("hi"), &EventContext::default()).await.expect("turn");

        assert!(matches!(outcome, TurnOutcome::Answered { .. }));
        assert_eq!(sender.count(), 2);
    }

    #[tokio::test]
    async fn channel_conversations_get_no_personal_additions() {
        let settings = TurnSettings { tips_enabled: true, usage_status_enabled: true, ..quiet() };
        let (processor, sender, _) = processor(FixedRelay::answering(json!("ok")), settings);
        let activity = message(json!({
            "type": "message",
            "text": "hi",
            "from": { "id": "29:u" },
            "conversation": { "id": "c", "conversationType": "channel", "isGroup": true }
        }));

        processor.handle_message(&activity, &EventContext::default()).await.expect("turn");

        assert_eq!(sender.count(), 2);
    }

    #[tokio::test]
    async fn members_added_are_welcomed_except_the_bot() {
        let (processor, sender, _) = processor(FixedRelay::answering(json!("")), quiet());
        let activity = message(json!({
            "type": "conversationUpdate",
            "recipient": { "id": "28:bot" },
            "membersAdded": [{ "id": "28:bot" }, { "id": "29:a" }, { "id": "29:b" }]
        }));

        let outcome =
            processor.handle_conversation_update(&activity, &EventContext::default()).await.expect("turn");

        assert_eq!(outcome, TurnOutcome::Welcomed { members: 2 });
        assert_eq!(sender.texts(), vec![WELCOME_TEXT.to_owned(), WELCOME_TEXT.to_owned()]);
    }
}
