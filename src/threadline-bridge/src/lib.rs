//! Slack thread to workflow backend conversation bridge.
//!
//! Every Slack thread the bot is mentioned in becomes one backend session.
//! Each new message in that thread runs one blocking workflow invocation with
//! the thread's prior messages as history, and the answer is posted back into
//! the thread.
//!
//! # Architecture
//!
//! - [`socket::BridgeBot`] holds the Socket Mode connection and acks envelopes
//! - [`dispatcher::EventDispatcher`] filters events (bot messages, edits, roots)
//! - [`bridge::ConversationBridge`] runs one turn: identity, session, history,
//!   invocation, reply
//!
//! # Example
//!
//! ```rust,ignore
//! use threadline_bridge::{BridgeBot, BridgeConfig};
//!
//! let config = BridgeConfig::from_env()?;
//! let bot = BridgeBot::new(&config)?;
//! bot.start().await?;
//! ```
//!
//! # Configuration
//!
//! Required environment variables:
//! - `SLACK_BOT_TOKEN` - Bot OAuth token (xoxb-...)
//! - `SLACK_APP_TOKEN` - App-level token for Socket Mode (xapp-...)
//! - `SLACK_SIGNING_SECRET` - Signing secret
//! - `SLACK_BOT_USER_ID` - The bot's own user id
//! - `WORKFLOW_ID` - Backend workflow to run
//! - `BACKEND_BASE_URL` - Backend API root
//! - `BACKEND_API_KEY` - Backend bearer token

pub mod backend;
pub mod bridge;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod history;
pub mod identity;
pub mod session;
pub mod slack;
pub mod socket;
pub mod thread_lock;
pub mod turn;

// Re-export main types
pub use backend::{BackendClient, ProvisionOutcome, WorkflowBackend};
pub use bridge::{ConversationBridge, FallbackReason, TurnOutcome};
pub use config::BridgeConfig;
pub use error::{BackendError, BridgeError, BridgeResult, SlackError, SlackResult};
pub use events::PlatformEvent;
pub use history::{ConversationTurn, Role};
pub use slack::{SlackClient, SlackPlatform};
pub use socket::{BotOptions, BridgeBot};
pub use turn::TurnStage;
