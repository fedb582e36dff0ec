//! Conversation history reconstruction.
//!
//! The bridge keeps no history of its own: every turn re-reads the thread
//! from Slack and splits it into the prior turns plus the message being
//! answered.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BridgeError, BridgeResult, SlackError};
use crate::events::PlatformEvent;
use crate::slack::{SlackMessage, SlackPlatform};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One role-tagged message, in the shape the backend expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Where the messages for a turn come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySource<'a> {
    /// A top-level mention: only the triggering message.
    Message {
        channel: &'a str,
        ts: &'a str,
        fallback_text: &'a str,
    },
    /// An existing thread: every message up to and including the trigger, root included.
    Thread {
        channel: &'a str,
        thread_ts: &'a str,
        until_ts: &'a str,
        fallback_text: &'a str,
    },
}

impl<'a> HistorySource<'a> {
    /// Pick the source for an inbound event.
    pub fn for_event(event: &'a PlatformEvent) -> Self {
        if event.is_fresh_mention() {
            HistorySource::Message {
                channel: &event.channel_id,
                ts: &event.event_ts,
                fallback_text: &event.raw_text,
            }
        } else {
            HistorySource::Thread {
                channel: &event.channel_id,
                thread_ts: event.thread_key(),
                until_ts: &event.event_ts,
                fallback_text: &event.raw_text,
            }
        }
    }
}

/// Prior turns plus the message being answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationHistory {
    /// Turns before the current message, oldest first.
    pub history: Vec<ConversationTurn>,
    /// Text of the triggering message.
    pub current_message: String,
}

/// Rebuilds [`ConversationHistory`] from the platform's message store.
pub struct HistoryReconstructor {
    platform: Arc<dyn SlackPlatform>,
    bot_user_id: String,
}

impl HistoryReconstructor {
    pub fn new(platform: Arc<dyn SlackPlatform>, bot_user_id: impl Into<String>) -> Self {
        Self {
            platform,
            bot_user_id: bot_user_id.into(),
        }
    }

    /// Fetch the messages for `source` and split them into history and current message.
    ///
    /// Messages posted after the trigger are ignored, so a turn that waited
    /// behind earlier turns in the same thread still answers its own message.
    pub async fn build_history(
        &self,
        source: HistorySource<'_>,
    ) -> BridgeResult<ConversationHistory> {
        let (messages, trigger_ts, fallback_text, only_trigger) = match source {
            HistorySource::Message {
                channel,
                ts,
                fallback_text,
            } => (
                self.platform.fetch_message(channel, ts).await,
                ts,
                fallback_text,
                true,
            ),
            HistorySource::Thread {
                channel,
                thread_ts,
                until_ts,
                fallback_text,
            } => (
                self.platform.fetch_thread(channel, thread_ts).await,
                until_ts,
                fallback_text,
                false,
            ),
        };
        let mut messages = messages.map_err(BridgeError::HistoryFetch)?;
        debug!("Fetched {} message(s) for {:?}", messages.len(), source);

        // `latest`+`inclusive` returns the previous channel message when the trigger is gone
        if only_trigger {
            messages.retain(|m| m.ts == trigger_ts);
        }

        split_history(&messages, &self.bot_user_id, trigger_ts, fallback_text).ok_or_else(|| {
            BridgeError::HistoryFetch(SlackError::EmptyThread(format!("{:?}", source)))
        })
    }
}

fn role_of(message: &SlackMessage, bot_user_id: &str) -> Role {
    if message.user.as_deref() == Some(bot_user_id) {
        Role::Assistant
    } else {
        Role::User
    }
}

/// Order two Slack timestamps (`seconds.micros`). Falls back to string order.
fn compare_ts(a: &str, b: &str) -> Ordering {
    fn parse(ts: &str) -> Option<(u64, u64)> {
        let (secs, frac) = ts.split_once('.').unwrap_or((ts, "0"));
        let frac = format!("{:0<6}", frac);
        Some((secs.parse().ok()?, frac.get(..6)?.parse().ok()?))
    }

    match (parse(a), parse(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Map messages up to `trigger_ts` to turns; the trigger itself becomes the current message.
///
/// When the trigger is missing or blank, `fallback_text` (the event's own
/// text) stands in for it. Returns `None` when neither has any text.
fn split_history(
    messages: &[SlackMessage],
    bot_user_id: &str,
    trigger_ts: &str,
    fallback_text: &str,
) -> Option<ConversationHistory> {
    let mut current = None;
    let mut history = Vec::new();

    for message in messages {
        match compare_ts(&message.ts, trigger_ts) {
            Ordering::Greater => continue,
            Ordering::Equal => {
                current = Some(message.text.as_str());
                continue;
            }
            Ordering::Less => {}
        }
        if message.text.trim().is_empty() {
            continue;
        }
        history.push(ConversationTurn::new(
            role_of(message, bot_user_id),
            message.text.clone(),
        ));
    }

    let current_message = current
        .filter(|text| !text.trim().is_empty())
        .or_else(|| Some(fallback_text).filter(|text| !text.trim().is_empty()))?;

    Some(ConversationHistory {
        history,
        current_message: current_message.to_string(),
    })
}
