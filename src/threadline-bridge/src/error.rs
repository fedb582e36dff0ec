//! Error types for the conversation bridge.
//!
//! Three layers:
//! - [`SlackError`] for platform transport and API failures,
//! - [`BackendError`] for workflow backend transport failures,
//! - [`BridgeError`], the per-turn taxonomy the bridge reasons about.
//!
//! Every per-turn `BridgeError` ends up as the same fallback reply; only
//! [`BridgeError::Configuration`] is fatal.

use thiserror::Error;

/// Errors that can occur while talking to Slack.
#[derive(Error, Debug)]
pub enum SlackError {
    /// Authentication error (invalid token, expired, etc.).
    #[error("Authentication error: {0}")]
    Auth(String),

    /// API request failed.
    #[error("Slack API error: {0}")]
    Api(String),

    /// API rate limited.
    #[error("Rate limited: retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Network/HTTP error.
    #[error("Network error: {0}")]
    Network(String),

    /// WebSocket connection error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// Operation timed out.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Channel not found or bot not in channel.
    #[error("Channel error: {0}")]
    Channel(String),

    /// Invalid payload received from Slack.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Thread had nothing left to answer after filtering.
    #[error("Empty thread: {0}")]
    EmptyThread(String),
}

impl From<reqwest::Error> for SlackError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SlackError::Timeout(err.to_string())
        } else if err.is_connect() {
            SlackError::Network(format!("Connection failed: {}", err))
        } else if err.is_decode() {
            SlackError::Json(err.to_string())
        } else {
            SlackError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SlackError {
    fn from(err: serde_json::Error) -> Self {
        SlackError::Json(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SlackError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SlackError::WebSocket(err.to_string())
    }
}

/// Result type for Slack operations.
pub type SlackResult<T> = std::result::Result<T, SlackError>;

/// Represents a Slack API response error (`"ok": false`).
#[derive(Debug, Clone)]
pub struct SlackApiError {
    /// Error code from Slack (e.g., "channel_not_found").
    pub code: String,
    /// Name of the API method that failed.
    pub method: String,
}

impl SlackApiError {
    /// Create a new API error.
    pub fn new(method: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            method: method.into(),
        }
    }
}

impl From<SlackApiError> for SlackError {
    fn from(err: SlackApiError) -> Self {
        match err.code.as_str() {
            // Default retry after 30 seconds if not specified
            "rate_limited" | "ratelimited" => SlackError::RateLimited {
                retry_after_secs: 30,
            },
            "invalid_auth" | "account_inactive" | "not_authed" | "token_revoked" => {
                SlackError::Auth(format!("{} failed: {}", err.method, err.code))
            }
            "channel_not_found" | "not_in_channel" | "thread_not_found" => {
                SlackError::Channel(format!("{} failed: {}", err.method, err.code))
            }
            _ => SlackError::Api(format!("{} failed: {}", err.method, err.code)),
        }
    }
}

/// Errors raised by the workflow backend client.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Network/HTTP transport error.
    #[error("Network error: {0}")]
    Network(String),

    /// Request exceeded the configured timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Backend answered with a status the endpoint contract does not allow.
    #[error("Unexpected status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// Response body could not be decoded or lacked a required field.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(err.to_string())
        } else if err.is_decode() {
            BackendError::InvalidResponse(err.to_string())
        } else {
            BackendError::Network(err.to_string())
        }
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Which backend record a provisioning failure concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionedResource {
    User,
    Session,
}

impl std::fmt::Display for ProvisionedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionedResource::User => f.write_str("user"),
            ProvisionedResource::Session => f.write_str("session"),
        }
    }
}

/// Per-turn and startup errors of the bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Missing or invalid configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// User or session could not be created or fetched.
    #[error("Failed to provision {resource}: {source}")]
    Provisioning {
        resource: ProvisionedResource,
        #[source]
        source: BackendError,
    },

    /// Conversation history could not be read from the platform.
    #[error("Failed to fetch history: {0}")]
    HistoryFetch(#[source] SlackError),

    /// Workflow invocation failed.
    #[error("Workflow invocation failed: {0}")]
    Invocation(#[source] BackendError),
}

impl BridgeError {
    /// Short, stable label used in logs and turn outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Configuration(_) => "configuration",
            BridgeError::Provisioning { .. } => "provisioning",
            BridgeError::HistoryFetch(_) => "history_fetch",
            BridgeError::Invocation(_) => "invocation",
        }
    }
}

/// Result type for bridge operations.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
