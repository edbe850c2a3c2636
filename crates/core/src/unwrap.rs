//! Resolution of nested, JSON-encoded workflow outputs.
//!
//! AI steps in the workflow sometimes echo structured output back as a JSON
//! string, so a reply can arrive as `{"output": "{\"output\": \"...\"}"}`.
//! [`unwrap_output`] peels up to [`MAX_UNWRAP_DEPTH`] levels of that encoding
//! and keeps the first attachment reference it finds, preferring deeper levels.

use serde::Serialize;
use serde_json::Value;

/// Fixed recursion bound for [`unwrap_output`].
pub const MAX_UNWRAP_DEPTH: i32 = 3;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnwrappedOutput {
    Text(String),
    TextWithAttachment { text: String, attachment_url: String },
}

impl UnwrappedOutput {
    pub fn text(&self) -> &str {
        match self {
            Self::Text(text) | Self::TextWithAttachment { text, .. } => text,
        }
    }

    pub fn attachment_url(&self) -> Option<&str> {
        match self {
            Self::Text(_) => None,
            Self::TextWithAttachment { attachment_url, .. } => Some(attachment_url),
        }
    }

    pub fn into_parts(self) -> (String, Option<String>) {
        match self {
            Self::Text(text) => (text, None),
            Self::TextWithAttachment { text, attachment_url } => (text, Some(attachment_url)),
        }
    }

    fn with_fallback_attachment(self, fallback: Option<String>) -> Self {
        match (self, fallback) {
            (Self::Text(text), Some(attachment_url)) => {
                Self::TextWithAttachment { text, attachment_url }
            }
            (unwrapped, _) => unwrapped,
        }
    }
}

pub fn unwrap_output(value: &Value) -> UnwrappedOutput {
    unwrap_with_depth(value, MAX_UNWRAP_DEPTH)
}

pub fn unwrap_with_depth(value: &Value, max_depth: i32) -> UnwrappedOutput {
    if max_depth <= 0 {
        return UnwrappedOutput::Text(coerce_text(value));
    }

    match value {
        Value::String(raw) => {
            if !looks_like_object(raw) {
                return UnwrappedOutput::Text(raw.clone());
            }

            match serde_json::from_str::<Value>(raw.trim()) {
                Ok(parsed) => match envelope_output(&parsed) {
                    Some(inner) => descend(inner, &parsed, max_depth),
                    None => UnwrappedOutput::Text(raw.clone()),
                },
                Err(_) => UnwrappedOutput::Text(raw.clone()),
            }
        }
        Value::Object(_) => match envelope_output(value) {
            Some(inner) => descend(inner, value, max_depth),
            None => UnwrappedOutput::Text(coerce_text(value)),
        },
        other => UnwrappedOutput::Text(coerce_text(other)),
    }
}

fn descend(inner: &Value, envelope: &Value, max_depth: i32) -> UnwrappedOutput {
    unwrap_with_depth(inner, max_depth - 1).with_fallback_attachment(attachment_url(envelope))
}

fn envelope_output(value: &Value) -> Option<&Value> {
    value.get("output").filter(|output| !output.is_null())
}

/// Reads `attachment` as either a URL string or an object carrying `url`.
fn attachment_url(envelope: &Value) -> Option<String> {
    let attachment = envelope.get("attachment")?;
    let url = match attachment {
        Value::String(url) => url.as_str(),
        Value::Object(fields) => fields.get("url").and_then(Value::as_str)?,
        _ => return None,
    };

    let url = url.trim();
    (!url.is_empty()).then(|| url.to_string())
}

fn looks_like_object(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.starts_with('{') && trimmed.ends_with('}')
}

fn coerce_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
