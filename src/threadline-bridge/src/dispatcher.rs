//! Inbound event classification.
//!
//! Decides whether an Events API payload is a new mention, a thread reply,
//! or something the bridge must ignore. Filtering happens here so the core
//! never sees the bot's own messages.

use tracing::debug;

use crate::events::{
    AppMentionEvent, EventPayload, MessageEvent, PlatformEvent, SlackEvent, mentions_user,
    parse_event,
};

/// Why an event was not handed to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Payload could not be parsed.
    Unparseable,
    /// Event type the bridge does not handle.
    UnsupportedEvent,
    /// Posted by a bot, including this one.
    FromBot,
    /// Edit, deletion, join or another message subtype.
    Subtype,
    /// Message outside a thread, or the thread root itself.
    NotThreadReply,
    /// Message mentions the bot and is delivered again as `app_mention`.
    DeliveredAsMention,
    /// Message has no author.
    NoAuthor,
}

/// Outcome of classifying one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Handle(PlatformEvent),
    Ignore(IgnoreReason),
}

/// Classifies Slack events relative to the bot's identity.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    bot_user_id: String,
}

impl EventDispatcher {
    pub fn new(bot_user_id: impl Into<String>) -> Self {
        Self {
            bot_user_id: bot_user_id.into(),
        }
    }

    /// Classify an Events API payload.
    pub fn classify(&self, payload: &EventPayload) -> Dispatch {
        let event_id = payload.event_id.clone();
        let team_id = payload.team_id.clone();

        let dispatch = match parse_event(payload) {
            Ok(SlackEvent::AppMention(event)) => self.classify_mention(&event, event_id, team_id),
            Ok(SlackEvent::Message(event)) => self.classify_message(&event, event_id, team_id),
            Ok(SlackEvent::Unknown) => Dispatch::Ignore(IgnoreReason::UnsupportedEvent),
            Err(e) => {
                debug!("Failed to parse event: {}", e);
                Dispatch::Ignore(IgnoreReason::Unparseable)
            }
        };

        if let Dispatch::Ignore(reason) = &dispatch {
            debug!("Ignoring event {:?}: {:?}", payload.event_id, reason);
        }
        dispatch
    }

    fn classify_mention(
        &self,
        event: &AppMentionEvent,
        event_id: Option<String>,
        team_id: Option<String>,
    ) -> Dispatch {
        if event.user.is_empty() {
            return Dispatch::Ignore(IgnoreReason::NoAuthor);
        }
        if event.user == self.bot_user_id {
            return Dispatch::Ignore(IgnoreReason::FromBot);
        }
        Dispatch::Handle(PlatformEvent::from_app_mention(event, event_id, team_id))
    }

    fn classify_message(
        &self,
        event: &MessageEvent,
        event_id: Option<String>,
        team_id: Option<String>,
    ) -> Dispatch {
        if event.is_bot_message() {
            return Dispatch::Ignore(IgnoreReason::FromBot);
        }
        if event.has_subtype() {
            return Dispatch::Ignore(IgnoreReason::Subtype);
        }
        if !event.is_thread_reply() {
            return Dispatch::Ignore(IgnoreReason::NotThreadReply);
        }
        if mentions_user(&event.text, &self.bot_user_id) {
            return Dispatch::Ignore(IgnoreReason::DeliveredAsMention);
        }

        match PlatformEvent::from_message(event, event_id, team_id) {
            Some(platform) if platform.author_id == self.bot_user_id => {
                Dispatch::Ignore(IgnoreReason::FromBot)
            }
            Some(platform) => Dispatch::Handle(platform),
            None => Dispatch::Ignore(IgnoreReason::NoAuthor),
        }
    }
}
