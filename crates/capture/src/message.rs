//! The canonical emitted unit and payload normalization.
//!
//! Every channel — DOM, transport frames, the decode tap, and an attached
//! dispatcher — funnels into [`CapturedMessage`]. Gateway-style payloads come
//! in three shapes: a socket frame (`{"t":"MESSAGE_CREATE","d":{...}}`), a
//! dispatcher action (`{"type":"MESSAGE_CREATE","message":{...}}`), and a
//! bare message object already unwrapped by the page.

use std::{collections::HashMap, fmt};

use {
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
};

/// Which channel produced an emitted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    Dom,
    Ws,
    Json,
    Dispatcher,
}

impl fmt::Display for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Dom => "dom",
            Self::Ws => "ws",
            Self::Json => "json",
            Self::Dispatcher => "dispatcher",
        };
        f.write_str(label)
    }
}

/// One normalized message event, the unit of the emission stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedMessage {
    pub id: String,
    pub content: String,
    pub author: String,
    pub author_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub guild_id: String,
    pub mention_everyone: bool,
    pub mentions: Vec<String>,
    pub timestamp: String,
    pub source: CaptureSource,
}

impl CapturedMessage {
    /// Composite dedup key; messages without an identifier can only be
    /// de-duplicated by node identity upstream.
    #[must_use]
    pub fn dedup_key(&self) -> Option<String> {
        if self.id.is_empty() {
            None
        } else {
            Some(format!("id:{}", self.id))
        }
    }
}

/// Workspace + channel identifier pair, derived from the page route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelKey {
    pub guild_id: String,
    pub channel_id: String,
}

impl ChannelKey {
    /// Parse `/channels/<guild>/<channel>` route paths. The guild segment may
    /// be a pseudo-identifier (direct-message views use `@me`).
    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        if segments.next() != Some("channels") {
            return None;
        }
        let guild_id = segments.next()?;
        let channel_id = segments.next()?;
        if channel_id.is_empty() {
            return None;
        }
        Some(Self {
            guild_id: guild_id.to_string(),
            channel_id: channel_id.to_string(),
        })
    }

    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.guild_id, self.channel_id)
    }
}

/// Resolve a display label for a channel: explicit name, then the configured
/// name map, then the raw id, then a placeholder.
#[must_use]
pub fn resolve_channel_label(
    names: &HashMap<String, String>,
    channel_name: &str,
    channel_id: &str,
) -> String {
    if !channel_name.is_empty() {
        return channel_name.to_string();
    }
    if let Some(name) = names.get(channel_id) {
        return name.clone();
    }
    if !channel_id.is_empty() {
        return channel_id.to_string();
    }
    "unknown-channel".to_string()
}

/// Extract a message-creation event from a decoded payload, if the value
/// structurally matches one of the known shapes. Returns the normalized
/// message tagged with the originating channel.
#[must_use]
pub fn message_from_payload(value: &Value, source: CaptureSource) -> Option<CapturedMessage> {
    let (body, channel_hint) = creation_body(value)?;

    let mut channel_id = string_field(body, "channel_id");
    if channel_id.is_empty() {
        if let Some(hint) = channel_hint {
            channel_id = hint;
        }
    }

    let (author, author_id) = match body.get("author").and_then(Value::as_object) {
        Some(author) => (string_field(author, "username"), string_field(author, "id")),
        None => (String::new(), String::new()),
    };

    let mentions = body
        .get("mentions")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| match entry {
                    Value::String(id) => Some(id.clone()),
                    Value::Object(user) => {
                        let id = string_field(user, "id");
                        (!id.is_empty()).then_some(id)
                    },
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Some(CapturedMessage {
        id: string_field(body, "id"),
        content: string_field(body, "content"),
        author,
        author_id,
        channel_id,
        channel_name: string_field(body, "channel_name"),
        guild_id: string_field(body, "guild_id"),
        mention_everyone: body
            .get("mention_everyone")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        mentions,
        timestamp: string_field(body, "timestamp"),
        source,
    })
}

/// Locate the message body inside a payload, together with a channel id
/// carried by the envelope rather than the body (dispatcher actions).
fn creation_body(value: &Value) -> Option<(&Map<String, Value>, Option<String>)> {
    let obj = value.as_object()?;

    // Socket frame: {"t":"MESSAGE_CREATE","d":{...}}
    if obj.get("t").and_then(Value::as_str) == Some("MESSAGE_CREATE") {
        return obj.get("d").and_then(Value::as_object).map(|d| (d, None));
    }

    // Dispatcher action: {"type":"MESSAGE_CREATE","message":{...},"channelId":...}
    if obj.get("type").and_then(Value::as_str) == Some("MESSAGE_CREATE") {
        let hint = obj.get("channelId").map(coerce_string).filter(|s| !s.is_empty());
        if let Some(message) = obj.get("message").and_then(Value::as_object) {
            return Some((message, hint));
        }
        if let Some(d) = obj.get("d").and_then(Value::as_object) {
            return Some((d, hint));
        }
        return None;
    }

    // Bare message object already unwrapped by the page.
    if obj.contains_key("id")
        && obj.contains_key("channel_id")
        && (obj.contains_key("content") || obj.contains_key("author"))
    {
        return Some((obj, None));
    }

    None
}

/// Field access tolerating numeric identifiers.
fn string_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key).map(coerce_string).unwrap_or_default()
}

fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}
