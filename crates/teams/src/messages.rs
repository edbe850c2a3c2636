use serde::Serialize;
use serde_json::{json, Value};

use courier_core::FeedbackRecord;

pub const THINKING_TEXT: &str =
    "Thinking...  \n(Responses will be generated using AI and may contain mistakes.)";
pub const NO_RESPONSE_TEXT: &str = "Sorry, I could not get a response from the agent.";
pub const WELCOME_TEXT: &str = "Hello and welcome! I am your AI agent. How can I help you today?";
pub const FEEDBACK_THANKS_TEXT: &str = "Thanks for your feedback! It helps us improve the agent.";
pub const FEEDBACK_DISMISSED_TEXT: &str = "No problem. I won't ask again today.";

pub const FEEDBACK_ACTION: &str = "feedback";
pub const ADAPTIVE_CARD_CONTENT_TYPE: &str = "application/vnd.microsoft.card.adaptive";
const GENERIC_FILE_CONTENT_TYPE: &str = "application/octet-stream";
const ADAPTIVE_CARD_VERSION: &str = "1.4";

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingActivity {
    #[serde(rename = "type")]
    pub activity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<OutgoingAttachment>,
}

impl OutgoingActivity {
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }

    pub fn has_card(&self) -> bool {
        self.attachments.iter().any(|attachment| attachment.content_type == ADAPTIVE_CARD_CONTENT_TYPE)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingAttachment {
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl OutgoingAttachment {
    pub fn file(url: impl Into<String>) -> Self {
        Self {
            content_type: GENERIC_FILE_CONTENT_TYPE.to_owned(),
            content_url: Some(url.into()),
            content: None,
            name: Some("attachment".to_owned()),
        }
    }

    pub fn card(card: AdaptiveCard) -> Self {
        Self {
            content_type: ADAPTIVE_CARD_CONTENT_TYPE.to_owned(),
            content_url: None,
            content: Some(card.into_value()),
            name: None,
        }
    }
}

pub struct ReplyBuilder {
    text: Option<String>,
    attachments: Vec<OutgoingAttachment>,
}

impl ReplyBuilder {
    pub fn new() -> Self {
        Self { text: None, attachments: Vec::new() }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn attachment(mut self, attachment: OutgoingAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn build(self) -> OutgoingActivity {
        OutgoingActivity {
            activity_type: "message".to_owned(),
            text: self.text,
            attachments: self.attachments,
        }
    }
}

impl Default for ReplyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum CardElement {
    TextBlock {
        text: String,
        wrap: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        weight: Option<String>,
        #[serde(rename = "isSubtle", skip_serializing_if = "Option::is_none")]
        is_subtle: Option<bool>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum CardAction {
    #[serde(rename = "Action.Submit")]
    Submit { title: String, data: Value },
    #[serde(rename = "Action.OpenUrl")]
    OpenUrl { title: String, url: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AdaptiveCard {
    #[serde(rename = "type")]
    card_type: &'static str,
    #[serde(rename = "$schema")]
    schema: &'static str,
    version: &'static str,
    body: Vec<CardElement>,
    actions: Vec<CardAction>,
}

impl AdaptiveCard {
    pub fn new() -> Self {
        Self {
            card_type: "AdaptiveCard",
            schema: "http://adaptivecards.io/schemas/adaptive-card.json",
            version: ADAPTIVE_CARD_VERSION,
            body: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn heading(mut self, text: impl Into<String>) -> Self {
        self.body.push(CardElement::TextBlock {
            text: text.into(),
            wrap: true,
            weight: Some("Bolder".to_owned()),
            is_subtle: None,
        });
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.body.push(CardElement::TextBlock { text: text.into(), wrap: true, weight: None, is_subtle: None });
        self
    }

    pub fn subtle(mut self, text: impl Into<String>) -> Self {
        self.body.push(CardElement::TextBlock {
            text: text.into(),
            wrap: true,
            weight: None,
            is_subtle: Some(true),
        });
        self
    }

    pub fn submit(mut self, title: impl Into<String>, data: Value) -> Self {
        self.actions.push(CardAction::Submit { title: title.into(), data });
        self
    }

    pub fn open_url(mut self, title: impl Into<String>, url: impl Into<String>) -> Self {
        self.actions.push(CardAction::OpenUrl { title: title.into(), url: url.into() });
        self
    }

    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Default for AdaptiveCard {
    fn default() -> Self {
        Self::new()
    }
}

/// A rating card submission, as posted back in `activity.value`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeedbackSubmission {
    pub rating: Option<u8>,
}

impl FeedbackSubmission {
    /// Returns `None` unless the value is a feedback action. Ratings outside
    /// 1..=5 are treated as a dismissal.
    pub fn from_value(value: &Value) -> Option<Self> {
        if value.get("action").and_then(Value::as_str) != Some(FEEDBACK_ACTION) {
            return None;
        }

        let rating = match value.get("rating") {
            Some(Value::Number(number)) => number.as_u64(),
            Some(Value::String(raw)) => raw.trim().parse::<u64>().ok(),
            _ => None,
        }
        .filter(|rating| (1..=5).contains(rating))
        .and_then(|rating| u8::try_from(rating).ok());

        Some(Self { rating })
    }
}

pub fn thinking_message() -> OutgoingActivity {
    ReplyBuilder::new().text(THINKING_TEXT).build()
}

pub fn agent_reply(text: impl Into<String>, attachment_url: Option<&str>) -> OutgoingActivity {
    let builder = ReplyBuilder::new().text(text);
    match attachment_url {
        Some(url) => builder.attachment(OutgoingAttachment::file(url)).build(),
        None => builder.build(),
    }
}

pub fn welcome_message() -> OutgoingActivity {
    ReplyBuilder::new().text(WELCOME_TEXT).build()
}

pub fn feedback_acknowledgement(submission: FeedbackSubmission) -> OutgoingActivity {
    let text = match submission.rating {
        Some(_) => FEEDBACK_THANKS_TEXT,
        None => FEEDBACK_DISMISSED_TEXT,
    };
    ReplyBuilder::new().text(text).build()
}

pub fn feedback_prompt_card() -> OutgoingActivity {
    let card = (1..=5u8).fold(
        AdaptiveCard::new()
            .heading("How helpful was the agent today?")
            .subtle("Rate from 1 (not helpful) to 5 (very helpful). I only ask once a day."),
        |card, rating| {
            card.submit("★".repeat(usize::from(rating)), json!({ "action": FEEDBACK_ACTION, "rating": rating }))
        },
    )
    .submit("Not now", json!({ "action": FEEDBACK_ACTION }));

    ReplyBuilder::new().attachment(OutgoingAttachment::card(card)).build()
}

pub fn account_link_card(magic_link: &str) -> OutgoingActivity {
    let card = AdaptiveCard::new()
        .heading("Connect your workspace")
        .text("Open the integration platform to manage the tools the agent can use on your behalf.")
        .subtle("This link signs you in automatically and expires after 24 hours.")
        .open_url("Open workspace", magic_link);

    ReplyBuilder::new().attachment(OutgoingAttachment::card(card)).build()
}

pub fn tip_message(tip: &str) -> OutgoingActivity {
    ReplyBuilder::new().text(format!("💡 Tip: {tip}")).build()
}

/// Picks a tip that matches what the user just did.
pub fn contextual_tip(has_file_references: bool, is_thread_reply: bool) -> &'static str {
    if has_file_references {
        "Share files as SharePoint or OneDrive links so the agent can open them directly."
    } else if is_thread_reply {
        "Replies in a thread keep the context of the quoted message for the agent."
    } else {
        "Ask follow-up questions in the same chat to refine an answer."
    }
}

pub fn usage_status_message(record: Option<&FeedbackRecord>) -> OutgoingActivity {
    let started = record
        .and_then(|record| record.first_interaction_at.or(record.prompted_at))
        .map(|at| format!("first message today at {} UTC", at.format("%H:%M")))
        .unwrap_or_else(|| "first message today".to_owned());

    let feedback = match record {
        Some(record) if record.feedback_given => match record.rating {
            Some(rating) => format!("feedback given ({rating}/5)"),
            None => "feedback prompt dismissed".to_owned(),
        },
        Some(record) if record.feedback_prompted => "feedback requested".to_owned(),
        _ => "no feedback yet".to_owned(),
    };

    ReplyBuilder::new().text(format!("Usage status: {started} · {feedback}")).build()
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::json;

    use courier_core::FeedbackRecord;

    use super::{
        account_link_card, agent_reply, feedback_prompt_card, usage_status_message,
        FeedbackSubmission, ADAPTIVE_CARD_CONTENT_TYPE, THINKING_TEXT,
    };

    #[test]
    fn agent_reply_carries_the_attachment_url() {
        let reply = agent_reply("here you go", Some("https://files.example.com/report.pdf"));
        let serialized = serde_json::to_value(&reply).expect("serialize");

        assert_eq!(serialized["type"], "message");
        assert_eq!(serialized["text"], "here you go");
        assert_eq!(serialized["attachments"][0]["contentUrl"], "https://files.example.com/report.pdf");
        assert_eq!(serialized["attachments"][0]["contentType"], "application/octet-stream");
    }

    #[test]
    fn plain_reply_omits_attachments() {
        let serialized = serde_json::to_value(agent_reply("hi", None)).expect("serialize");

        assert!(serialized.get("attachments").is_none());
    }

    #[test]
    fn built_reply_leaves_addressing_to_the_sender() {
        let serialized = serde_json::to_value(agent_reply("hi", None)).expect("serialize");

        assert!(serialized.get("replyToId").is_none());
        assert!(serialized.get("conversation").is_none());
    }

    #[test]
    fn thinking_notice_carries_ai_disclaimer() {
        assert!(THINKING_TEXT.contains("may contain mistakes"));
    }

    #[test]
    fn feedback_card_offers_five_ratings_and_a_dismissal() {
        let message = feedback_prompt_card();
        let card = message.attachments[0].content.clone().expect("card content");

        assert_eq!(message.attachments[0].content_type, ADAPTIVE_CARD_CONTENT_TYPE);
        assert_eq!(card["type"], "AdaptiveCard");
        let actions = card["actions"].as_array().expect("actions");
        assert_eq!(actions.len(), 6);
        assert_eq!(actions[0]["type"], "Action.Submit");
        assert_eq!(actions[4]["data"], json!({ "action": "feedback", "rating": 5 }));
        assert_eq!(actions[5]["data"], json!({ "action": "feedback" }));
    }

    #[test]
    fn card_actions_round_trip_into_submissions() {
        let message = feedback_prompt_card();
        let card = message.attachments[0].content.clone().expect("card content");

        let submission =
            FeedbackSubmission::from_value(&card["actions"][2]["data"]).expect("feedback action");

        assert_eq!(submission.rating, Some(3));
    }

    #[test]
    fn submission_parsing_rejects_other_actions_and_bad_ratings() {
        assert_eq!(FeedbackSubmission::from_value(&json!({ "action": "other" })), None);
        assert_eq!(FeedbackSubmission::from_value(&json!("feedback")), None);
        assert_eq!(
            FeedbackSubmission::from_value(&json!({ "action": "feedback", "rating": "4" })),
            Some(FeedbackSubmission { rating: Some(4) })
        );
        assert_eq!(
            FeedbackSubmission::from_value(&json!({ "action": "feedback", "rating": 9 })),
            Some(FeedbackSubmission { rating: None })
        );
    }

    #[test]
    fn account_link_card_opens_the_magic_link() {
        let message = account_link_card("https://app.example.com/auth/magic-link?token=abc");
        let card = message.attachments[0].content.clone().expect("card content");

        assert_eq!(card["actions"][0]["type"], "Action.OpenUrl");
        assert_eq!(card["actions"][0]["url"], "https://app.example.com/auth/magic-link?token=abc");
    }

    #[test]
    fn usage_status_summarizes_todays_record() {
        let record = FeedbackRecord {
            user_id: "u".to_owned(),
            date: NaiveDate::from_ymd_opt(2026, 5, 4).expect("date"),
            feedback_prompted: true,
            feedback_given: true,
            rating: Some(4),
            first_interaction_at: Some(Utc.with_ymd_and_hms(2026, 5, 4, 9, 15, 0).unwrap()),
            prompted_at: None,
            given_at: None,
        };

        let message = usage_status_message(Some(&record));

        assert!(message.text().contains("09:15 UTC"));
        assert!(message.text().contains("feedback given (4/5)"));
        assert!(usage_status_message(None).text().contains("no feedback yet"));
    }
}
