//! Slack Web API client.
//!
//! Covers the handful of methods the bridge needs: `auth.test`,
//! `apps.connections.open`, `conversations.history`, `conversations.replies`
//! and `chat.postMessage`. The message-store and reply operations sit behind
//! [`SlackPlatform`] so the bridge can be exercised without Slack.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::error::{SlackApiError, SlackError, SlackResult};

/// Page size requested from `conversations.replies`.
const REPLIES_PAGE_LIMIT: u32 = 200;
/// Upper bound on pages fetched for a single thread.
const MAX_REPLY_PAGES: usize = 50;

/// A message as returned by the conversations APIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlackMessage {
    /// Author user id (absent for some bot and system messages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Bot id, set when a bot posted the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
    /// Message subtype (e.g. "channel_join").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Message text.
    #[serde(default)]
    pub text: String,
    /// Message timestamp.
    pub ts: String,
}

/// Platform operations the bridge depends on.
#[async_trait]
pub trait SlackPlatform: Send + Sync {
    /// Fetch the single message at `ts` in `channel`.
    async fn fetch_message(&self, channel: &str, ts: &str) -> SlackResult<Vec<SlackMessage>>;

    /// Fetch every message of a thread, root included, oldest first.
    async fn fetch_thread(&self, channel: &str, thread_ts: &str)
    -> SlackResult<Vec<SlackMessage>>;

    /// Post `text` into `channel`, optionally inside a thread. Returns the new message ts.
    async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> SlackResult<String>;
}

#[derive(Debug, Deserialize)]
struct AuthTestResponse {
    ok: bool,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectionsOpenResponse {
    ok: bool,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConversationsResponse {
    ok: bool,
    #[serde(default)]
    messages: Vec<SlackMessage>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn check_ok(method: &str, ok: bool, error: Option<String>) -> SlackResult<()> {
    if ok {
        return Ok(());
    }
    let code = error.unwrap_or_else(|| "unknown".to_string());
    Err(SlackApiError::new(method, code).into())
}

/// HTTP client for the Slack Web API.
#[derive(Clone)]
pub struct SlackClient {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    app_token: String,
}

impl SlackClient {
    /// Create a client from the bridge configuration.
    pub fn new(config: &BridgeConfig) -> SlackResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SlackError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: config.slack_api_base().to_string(),
            bot_token: config.bot_token().to_string(),
            app_token: config.app_token().to_string(),
        })
    }

    /// Call `auth.test` and return the bot's user id.
    pub async fn auth_test(&self) -> SlackResult<String> {
        debug!("Testing Slack authentication...");

        let response: AuthTestResponse = self
            .post_json("auth.test", &self.bot_token, &serde_json::json!({}))
            .await?;
        if !response.ok {
            return Err(SlackError::Auth(format!(
                "auth.test failed: {}",
                response.error.as_deref().unwrap_or("unknown")
            )));
        }

        response
            .user_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| SlackError::Api("auth.test did not return user_id".to_string()))
    }

    /// Get the WebSocket URL for Socket Mode.
    pub async fn open_socket_url(&self) -> SlackResult<String> {
        let response: ConnectionsOpenResponse = self
            .post_json(
                "apps.connections.open",
                &self.app_token,
                &serde_json::json!({}),
            )
            .await?;
        check_ok("apps.connections.open", response.ok, response.error)?;

        response
            .url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| SlackError::Api("Missing url in response".to_string()))
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        method: &str,
        token: &str,
        payload: &serde_json::Value,
    ) -> SlackResult<T> {
        let response = self
            .client
            .post(format!("{}/{}", self.api_base, method))
            .bearer_auth(token)
            .header("Content-Type", "application/json; charset=utf-8")
            .json(payload)
            .send()
            .await?;

        Self::decode(method, response).await
    }

    async fn get_query<T: DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, String)],
    ) -> SlackResult<T> {
        let response = self
            .client
            .get(format!("{}/{}", self.api_base, method))
            .bearer_auth(&self.bot_token)
            .query(query)
            .send()
            .await?;

        Self::decode(method, response).await
    }

    async fn decode<T: DeserializeOwned>(method: &str, response: reqwest::Response) -> SlackResult<T> {
        // Check for rate limiting
        if response.status() == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(30);
            warn!("{} rate limited, retry after {}s", method, retry_after);
            return Err(SlackError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SlackError::Api(format!("{} returned {}: {}", method, status, body)));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl SlackPlatform for SlackClient {
    async fn fetch_message(&self, channel: &str, ts: &str) -> SlackResult<Vec<SlackMessage>> {
        let response: ConversationsResponse = self
            .get_query(
                "conversations.history",
                &[
                    ("channel", channel.to_string()),
                    ("latest", ts.to_string()),
                    ("inclusive", "true".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        check_ok("conversations.history", response.ok, response.error)?;

        Ok(response.messages)
    }

    async fn fetch_thread(
        &self,
        channel: &str,
        thread_ts: &str,
    ) -> SlackResult<Vec<SlackMessage>> {
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_REPLY_PAGES {
            let mut query = vec![
                ("channel", channel.to_string()),
                ("ts", thread_ts.to_string()),
                ("limit", REPLIES_PAGE_LIMIT.to_string()),
            ];
            if let Some(cursor) = cursor.take() {
                query.push(("cursor", cursor));
            }

            let response: ConversationsResponse =
                self.get_query("conversations.replies", &query).await?;
            check_ok("conversations.replies", response.ok, response.error)?;
            messages.extend(response.messages);

            cursor = response
                .response_metadata
                .and_then(|meta| meta.next_cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                return Ok(messages);
            }
        }

        warn!(
            "Thread {} in {} exceeded {} pages, history truncated",
            thread_ts, channel, MAX_REPLY_PAGES
        );
        Ok(messages)
    }

    async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> SlackResult<String> {
        let mut payload = serde_json::json!({
            "channel": channel,
            "text": text,
        });
        if let Some(thread_ts) = thread_ts {
            payload["thread_ts"] = serde_json::json!(thread_ts);
        }

        let response: PostMessageResponse = self
            .post_json("chat.postMessage", &self.bot_token, &payload)
            .await?;
        check_ok("chat.postMessage", response.ok, response.error)?;

        response
            .ts
            .ok_or_else(|| SlackError::Api("Missing ts in response".to_string()))
    }
}
