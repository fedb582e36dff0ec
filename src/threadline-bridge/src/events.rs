//! Slack event payloads and the bridge's own event model.
//!
//! Handles the Slack events the bridge cares about:
//! - `app_mention` - When the bot is @mentioned
//! - `message` - Messages in channels the bot is a member of (thread replies)
//!
//! Events are received via Socket Mode WebSocket connection and turned into
//! [`PlatformEvent`]s by the dispatcher.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SlackError, SlackResult};

/// Slack event types that we handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlackEvent {
    /// App mention event (@bot in a channel).
    AppMention(AppMentionEvent),
    /// Message event.
    Message(MessageEvent),
    /// Unknown event type (for forward compatibility).
    #[serde(other)]
    Unknown,
}

/// Event payload for app mentions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMentionEvent {
    /// User who mentioned the bot.
    #[serde(default)]
    pub user: String,
    /// Text of the message (including the mention).
    #[serde(default)]
    pub text: String,
    /// Channel where the mention occurred.
    pub channel: String,
    /// Timestamp of the message.
    pub ts: String,
    /// Thread timestamp (if in a thread).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    /// Event timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_ts: Option<String>,
    /// Bot ID (if the mention was posted by a bot).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
}

/// Event payload for messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    /// User who sent the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Text of the message.
    #[serde(default)]
    pub text: String,
    /// Channel where the message was sent.
    pub channel: String,
    /// Channel type (im, channel, group, mpim).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_type: Option<String>,
    /// Timestamp of the message.
    pub ts: String,
    /// Thread timestamp (if in a thread).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    /// Event timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_ts: Option<String>,
    /// Subtype of message (e.g., "bot_message").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Bot ID (if message is from a bot).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
}

impl MessageEvent {
    /// Check if this is a bot message (should be ignored).
    pub fn is_bot_message(&self) -> bool {
        self.bot_id.is_some() || self.subtype.as_deref() == Some("bot_message")
    }

    /// Check if this message is a reply inside an existing thread.
    ///
    /// A thread root carries `thread_ts == ts` once it has replies.
    pub fn is_thread_reply(&self) -> bool {
        self.thread_ts
            .as_deref()
            .is_some_and(|thread_ts| thread_ts != self.ts)
    }

    /// Check if this is an edit, deletion or other non-plain message.
    pub fn has_subtype(&self) -> bool {
        self.subtype.is_some()
    }
}

/// Socket Mode envelope wrapping events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketModeEnvelope {
    /// Envelope ID for acknowledgment. Absent on `hello`.
    #[serde(default)]
    pub envelope_id: String,
    /// Type of payload.
    #[serde(rename = "type")]
    pub envelope_type: String,
    /// Actual payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<EventPayload>,
    /// Accepts response payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepts_response_payload: Option<bool>,
    /// Delivery attempt counter (> 1 on redelivery).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_attempt: Option<u32>,
    /// Reason for redelivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_reason: Option<String>,
}

/// Event callback payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    /// Team ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    /// API app ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_app_id: Option<String>,
    /// The actual event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<serde_json::Value>,
    /// Event type.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "type")]
    pub payload_type: Option<String>,
    /// Event ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Event time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_time: Option<u64>,
}

/// Socket Mode acknowledgment response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketModeAck {
    /// Envelope ID being acknowledged.
    pub envelope_id: String,
}

impl SocketModeAck {
    /// Create a simple acknowledgment.
    pub fn new(envelope_id: impl Into<String>) -> Self {
        Self {
            envelope_id: envelope_id.into(),
        }
    }
}

/// Parse a raw event from the Socket Mode envelope.
pub fn parse_event(payload: &EventPayload) -> SlackResult<SlackEvent> {
    let event_json = payload
        .event
        .as_ref()
        .ok_or_else(|| SlackError::InvalidPayload("Missing event field".to_string()))?;

    // Get event type
    let event_type = event_json
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("unknown");

    debug!("Parsing event type: {}", event_type);

    match event_type {
        "app_mention" => {
            let event: AppMentionEvent = serde_json::from_value(event_json.clone())?;
            Ok(SlackEvent::AppMention(event))
        }
        "message" => {
            let event: MessageEvent = serde_json::from_value(event_json.clone())?;
            Ok(SlackEvent::Message(event))
        }
        _ => {
            warn!("Unknown event type: {}", event_type);
            Ok(SlackEvent::Unknown)
        }
    }
}

/// Check whether `text` contains a `<@USER>` or `<@USER|name>` mention of `user_id`.
pub fn mentions_user(text: &str, user_id: &str) -> bool {
    text.contains(&format!("<@{}>", user_id)) || text.contains(&format!("<@{}|", user_id))
}

/// How the dispatcher classified an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Mention,
    Reply,
    Other,
}

/// One inbound delivery, normalized for the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformEvent {
    /// Slack `event_id` when present, otherwise `channel:ts`.
    pub event_id: String,
    pub kind: EventKind,
    pub channel_id: String,
    /// Root timestamp of the enclosing thread, absent for a top-level mention.
    pub thread_root_ts: Option<String>,
    /// Timestamp of the message itself.
    pub event_ts: String,
    pub author_id: String,
    pub is_from_bot: bool,
    pub raw_text: String,
    /// Workspace the event came from.
    pub team_id: Option<String>,
}

impl PlatformEvent {
    /// Build from an app mention.
    pub fn from_app_mention(
        event: &AppMentionEvent,
        event_id: Option<String>,
        team_id: Option<String>,
    ) -> Self {
        Self {
            event_id: event_id.unwrap_or_else(|| format!("{}:{}", event.channel, event.ts)),
            kind: EventKind::Mention,
            channel_id: event.channel.clone(),
            thread_root_ts: event.thread_ts.clone(),
            event_ts: event.ts.clone(),
            author_id: event.user.clone(),
            is_from_bot: event.bot_id.is_some(),
            raw_text: event.text.clone(),
            team_id,
        }
    }

    /// Build from a message event. Returns `None` when the message has no author.
    pub fn from_message(
        event: &MessageEvent,
        event_id: Option<String>,
        team_id: Option<String>,
    ) -> Option<Self> {
        let author_id = event.user.clone()?;
        let kind = if event.is_thread_reply() {
            EventKind::Reply
        } else {
            EventKind::Other
        };

        Some(Self {
            event_id: event_id.unwrap_or_else(|| format!("{}:{}", event.channel, event.ts)),
            kind,
            channel_id: event.channel.clone(),
            thread_root_ts: event.thread_ts.clone(),
            event_ts: event.ts.clone(),
            author_id,
            is_from_bot: event.is_bot_message(),
            raw_text: event.text.clone(),
            team_id,
        })
    }

    /// Thread key: the root timestamp, falling back to the message's own timestamp.
    pub fn thread_key(&self) -> &str {
        self.thread_root_ts.as_deref().unwrap_or(&self.event_ts)
    }

    /// True when this is a mention that starts a brand new thread.
    pub fn is_fresh_mention(&self) -> bool {
        self.kind == EventKind::Mention && self.thread_root_ts.is_none()
    }

    /// Key identifying the underlying message, shared by every event about it.
    pub fn message_key(&self) -> String {
        format!("{}:{}", self.channel_id, self.event_ts)
    }
}
