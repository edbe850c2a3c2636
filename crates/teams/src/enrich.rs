//! Metadata added to an activity before it is relayed to the workflow.
//!
//! The enricher never mutates the inbound activity. [`build_payload`] returns
//! the activity as JSON with two extra blocks: `_fileDetection` for file
//! references and `custom` for thread, user and conversation context.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::activity::{non_blank, Activity, Attachment};

pub const REPLY_MARKER: &str = r#"itemtype="http://schema.skype.com/Reply""#;
pub const ORIGINAL_MESSAGE_UNAVAILABLE_REASON: &str =
    "channel message history is not readable with the relay's permissions";

const HTML: &str = "text/html";
const PLAIN: &str = "text/plain";

/// Optional identity details resolved outside the activity itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtendedIdentity {
    pub email: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDetection {
    pub has_non_html_attachments: bool,
    pub detected_file_urls: Vec<String>,
    pub attachment_types: Vec<Option<String>>,
    pub entity_types: Vec<Option<String>>,
    pub possible_file_attachments: Vec<Attachment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OriginalMessage {
    Unavailable { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadContext {
    pub is_thread_reply: bool,
    pub thread_message_id: Option<String>,
    pub original_message: Option<OriginalMessage>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub id: Option<String>,
    pub name: Option<String>,
    pub aad_object_id: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub conversation_type: Option<String>,
    pub is_personal: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CustomContext {
    pub thread: ThreadContext,
    pub user: UserContext,
    pub conversation: ConversationContext,
}

pub fn is_thread_reply(activity: &Activity) -> bool {
    if non_blank(activity.reply_to_id.as_deref()).is_some() {
        return true;
    }

    reply_quote_html(activity).next().is_some()
}

pub fn extract_thread_id(activity: &Activity) -> Option<String> {
    if let Some(reply_to_id) = non_blank(activity.reply_to_id.as_deref()) {
        return Some(reply_to_id.to_owned());
    }

    reply_quote_html(activity).find_map(|html| {
        let marker_tag = reply_tag_regex().find(html)?;
        item_id_regex().captures(marker_tag.as_str()).and_then(|captures| captures.get(1)).map(|id| id.as_str().to_owned())
    })
}

pub fn thread_context(activity: &Activity) -> ThreadContext {
    let is_thread_reply = is_thread_reply(activity);
    let thread_message_id = extract_thread_id(activity);
    let original_message = is_thread_reply.then(|| {
        debug!(
            event_name = "enrich.thread.original_unavailable",
            correlation_id = %activity.correlation_id(),
            thread_message_id = thread_message_id.as_deref().unwrap_or_default(),
            "original thread message cannot be fetched"
        );
        OriginalMessage::Unavailable { reason: ORIGINAL_MESSAGE_UNAVAILABLE_REASON.to_owned() }
    });

    ThreadContext { is_thread_reply, thread_message_id, original_message }
}

/// One-on-one chat with the bot. A missing conversation type counts as personal.
pub fn is_personal_conversation(activity: &Activity) -> bool {
    let Some(conversation) = activity.conversation.as_ref() else {
        return true;
    };

    let personal_type = match non_blank(conversation.conversation_type.as_deref()) {
        None => true,
        Some(conversation_type) => conversation_type.eq_ignore_ascii_case("personal"),
    };
    personal_type && conversation.is_group != Some(true)
}

pub fn detect_files(activity: &Activity) -> FileDetection {
    let is_file_candidate =
        |attachment: &&Attachment| !attachment.content_type_is(HTML) && !attachment.content_type_is(PLAIN);

    FileDetection {
        has_non_html_attachments: activity.attachments().iter().any(|attachment| is_file_candidate(&attachment)),
        detected_file_urls: detect_file_urls(activity.text()),
        attachment_types: activity
            .attachments()
            .iter()
            .map(|attachment| attachment.content_type.clone())
            .collect(),
        entity_types: activity.entities().iter().map(|entity| entity.entity_type.clone()).collect(),
        possible_file_attachments: activity
            .attachments()
            .iter()
            .filter(is_file_candidate)
            .filter(|attachment| non_blank(attachment.content_url.as_deref()).is_some())
            .cloned()
            .collect(),
    }
}

/// SharePoint, OneDrive, Office and Teams links found in message text, in order of appearance.
pub fn detect_file_urls(text: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for pattern in [sharepoint_url_regex(), teams_url_regex()] {
        for found in pattern.find_iter(text) {
            if !urls.iter().any(|url| url == found.as_str()) {
                urls.push(found.as_str().to_owned());
            }
        }
    }
    urls
}

pub fn custom_context(activity: &Activity, identity: Option<&ExtendedIdentity>) -> CustomContext {
    let from = activity.from.as_ref();
    let conversation = activity.conversation.as_ref();

    CustomContext {
        thread: thread_context(activity),
        user: UserContext {
            id: activity.user_id().map(str::to_owned),
            name: activity.user_name().map(str::to_owned),
            aad_object_id: from.and_then(|from| non_blank(from.aad_object_id.as_deref())).map(str::to_owned),
            tenant_id: activity.tenant_id().map(str::to_owned),
            email: identity.and_then(|identity| non_blank(identity.email.as_deref())).map(str::to_owned),
        },
        conversation: ConversationContext {
            id: activity.conversation_id().map(str::to_owned),
            conversation_type: conversation
                .and_then(|conversation| non_blank(conversation.conversation_type.as_deref()))
                .map(str::to_owned),
            is_personal: is_personal_conversation(activity),
        },
    }
}

/// The activity verbatim plus `_fileDetection` and `custom`.
pub fn build_payload(
    activity: &Activity,
    identity: Option<&ExtendedIdentity>,
) -> Result<Value, serde_json::Error> {
    let mut payload = match serde_json::to_value(activity)? {
        Value::Object(fields) => fields,
        _ => Map::new(),
    };

    payload.insert("_fileDetection".to_owned(), serde_json::to_value(detect_files(activity))?);
    payload.insert("custom".to_owned(), serde_json::to_value(custom_context(activity, identity))?);
    Ok(Value::Object(payload))
}

fn reply_quote_html(activity: &Activity) -> impl Iterator<Item = &str> {
    activity
        .attachments()
        .iter()
        .filter(|attachment| attachment.content_type_is(HTML))
        .filter_map(Attachment::content_text)
        .filter(|html| html.contains(REPLY_MARKER))
}

/// The opening tag that carries the quoted-reply marker, in any attribute order.
fn reply_tag_regex() -> &'static Regex {
    static REPLY_TAG_RE: OnceLock<Regex> = OnceLock::new();
    REPLY_TAG_RE.get_or_init(|| {
        Regex::new(r#"<[^>]*itemtype="http://schema\.skype\.com/Reply"[^>]*>"#).expect("reply tag regex must compile")
    })
}

fn item_id_regex() -> &'static Regex {
    static ITEM_ID_RE: OnceLock<Regex> = OnceLock::new();
    ITEM_ID_RE.get_or_init(|| Regex::new(r#"itemid="([^"]+)""#).expect("item id regex must compile"))
}

fn sharepoint_url_regex() -> &'static Regex {
    static SHAREPOINT_URL_RE: OnceLock<Regex> = OnceLock::new();
    SHAREPOINT_URL_RE.get_or_init(|| {
        Regex::new(r"(?i)https://[^\s]*\.(sharepoint\.com|microsoft\.com|office\.com)[^\s]*")
            .expect("sharepoint url regex must compile")
    })
}

fn teams_url_regex() -> &'static Regex {
    static TEAMS_URL_RE: OnceLock<Regex> = OnceLock::new();
    TEAMS_URL_RE.get_or_init(|| {
        Regex::new(r"(?i)https://teams\.microsoft\.com[^\s]*").expect("teams url regex must compile")
    })
}
