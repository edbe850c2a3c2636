//! Inbound channel activities.
//!
//! Only the fields the relay reads are typed. Everything else lands in the
//! flattened `extra` maps so a re-serialized activity carries the original
//! event verbatim.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type", default)]
    pub activity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<Entity>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    /// `Some(Value::Null)` when the channel sent an explicit `null`.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members_added: Option<Vec<ChannelAccount>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAccount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aad_object_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationAccount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_group: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Attachment {
    pub fn content_type_is(&self, expected: &str) -> bool {
        self.content_type.as_deref().is_some_and(|content_type| content_type.eq_ignore_ascii_case(expected))
    }

    /// Inline content as text, when the channel sent it as a string.
    pub fn content_text(&self) -> Option<&str> {
        self.content.as_ref().and_then(Value::as_str)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Message,
    ConversationUpdate,
    Event,
    Invoke,
    Unsupported,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::ConversationUpdate => "conversationUpdate",
            Self::Event => "event",
            Self::Invoke => "invoke",
            Self::Unsupported => "unsupported",
        }
    }
}

impl Activity {
    pub fn kind(&self) -> ActivityKind {
        match self.activity_type.as_str() {
            "message" => ActivityKind::Message,
            "conversationUpdate" => ActivityKind::ConversationUpdate,
            "event" => ActivityKind::Event,
            "invoke" => ActivityKind::Invoke,
            _ => ActivityKind::Unsupported,
        }
    }

    /// Stable user id: the directory object id when present, else the channel id.
    pub fn user_id(&self) -> Option<&str> {
        let from = self.from.as_ref()?;
        non_blank(from.aad_object_id.as_deref()).or_else(|| non_blank(from.id.as_deref()))
    }

    pub fn user_name(&self) -> Option<&str> {
        self.from.as_ref().and_then(|from| non_blank(from.name.as_deref()))
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation.as_ref().and_then(|conversation| non_blank(conversation.id.as_deref()))
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.conversation.as_ref().and_then(|conversation| non_blank(conversation.tenant_id.as_deref()))
    }

    pub fn correlation_id(&self) -> String {
        non_blank(self.id.as_deref()).unwrap_or("unknown-correlation-id").to_owned()
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }

    pub fn attachments(&self) -> &[Attachment] {
        self.attachments.as_deref().unwrap_or_default()
    }

    pub fn entities(&self) -> &[Entity] {
        self.entities.as_deref().unwrap_or_default()
    }

    pub fn members_added(&self) -> &[ChannelAccount] {
        self.members_added.as_deref().unwrap_or_default()
    }
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Distinguishes an explicit `null` from an absent field.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}
