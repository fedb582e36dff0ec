//! Configuration for the conversation bridge.
//!
//! Supports loading configuration from:
//! - Environment variables
//! - A TOML configuration file
//!
//! Both paths go through the same required-value checks and
//! [`BridgeConfig::validate`], so a missing credential is always reported
//! before the bridge touches the network.

use std::path::Path;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};

/// Default Slack Web API base URL.
pub const DEFAULT_SLACK_API_BASE: &str = "https://slack.com/api";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DEDUP_WINDOW_SECS: u64 = 600;
const DEFAULT_DEDUP_CAPACITY: usize = 1024;

/// Configuration for the bridge.
#[derive(Clone)]
pub struct BridgeConfig {
    /// Bot OAuth token (xoxb-...).
    bot_token: SecretString,
    /// App-level token for Socket Mode (xapp-...).
    app_token: SecretString,
    /// Signing secret of the Slack app.
    signing_secret: SecretString,
    /// Slack user id of the bot itself.
    bot_user_id: String,
    /// Workflow every conversation is routed to.
    workflow_id: String,
    /// Base URL of the workflow backend.
    backend_base_url: String,
    /// Bearer token for the workflow backend.
    backend_api_key: SecretString,
    /// Slack Web API base URL.
    slack_api_base: String,
    /// Timeout applied to every outbound HTTP call.
    request_timeout: Duration,
    /// How long a handled message stays in the dedup window.
    dedup_window: Duration,
    /// Maximum number of messages tracked by the dedup window.
    dedup_capacity: usize,
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("bot_token", &"[REDACTED]")
            .field("app_token", &"[REDACTED]")
            .field("signing_secret", &"[REDACTED]")
            .field("bot_user_id", &self.bot_user_id)
            .field("workflow_id", &self.workflow_id)
            .field("backend_base_url", &self.backend_base_url)
            .field("backend_api_key", &"[REDACTED]")
            .field("slack_api_base", &self.slack_api_base)
            .field("request_timeout", &self.request_timeout)
            .field("dedup_window", &self.dedup_window)
            .field("dedup_capacity", &self.dedup_capacity)
            .finish()
    }
}

/// Raw settings as read from a file or the environment, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawBridgeConfig {
    pub slack_bot_token: Option<String>,
    pub slack_app_token: Option<String>,
    pub slack_signing_secret: Option<String>,
    pub slack_bot_user_id: Option<String>,
    pub workflow_id: Option<String>,
    pub backend_base_url: Option<String>,
    pub backend_api_key: Option<String>,
    pub slack_api_base: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub dedup_window_secs: Option<u64>,
    pub dedup_capacity: Option<usize>,
}

impl RawBridgeConfig {
    /// Collect settings through a variable lookup function.
    ///
    /// `from_env` passes `std::env::var`; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> BridgeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            slack_bot_token: get("SLACK_BOT_TOKEN"),
            slack_app_token: get("SLACK_APP_TOKEN"),
            slack_signing_secret: get("SLACK_SIGNING_SECRET"),
            slack_bot_user_id: get("SLACK_BOT_USER_ID"),
            workflow_id: get("WORKFLOW_ID"),
            backend_base_url: get("BACKEND_BASE_URL"),
            backend_api_key: get("BACKEND_API_KEY"),
            slack_api_base: get("SLACK_API_BASE"),
            request_timeout_secs: parse_number(
                "BRIDGE_REQUEST_TIMEOUT_SECS",
                get("BRIDGE_REQUEST_TIMEOUT_SECS"),
            )?,
            dedup_window_secs: parse_number(
                "BRIDGE_DEDUP_WINDOW_SECS",
                get("BRIDGE_DEDUP_WINDOW_SECS"),
            )?,
            dedup_capacity: parse_number("BRIDGE_DEDUP_CAPACITY", get("BRIDGE_DEDUP_CAPACITY"))?,
        })
    }

    /// Check required values and build a validated configuration.
    pub fn build(self) -> BridgeResult<BridgeConfig> {
        let config = BridgeConfig {
            bot_token: secret(required("SLACK_BOT_TOKEN", self.slack_bot_token)?),
            app_token: secret(required("SLACK_APP_TOKEN", self.slack_app_token)?),
            signing_secret: secret(required(
                "SLACK_SIGNING_SECRET",
                self.slack_signing_secret,
            )?),
            bot_user_id: required("SLACK_BOT_USER_ID", self.slack_bot_user_id)?,
            workflow_id: required("WORKFLOW_ID", self.workflow_id)?,
            backend_base_url: required("BACKEND_BASE_URL", self.backend_base_url)?
                .trim_end_matches('/')
                .to_string(),
            backend_api_key: secret(required("BACKEND_API_KEY", self.backend_api_key)?),
            slack_api_base: self
                .slack_api_base
                .unwrap_or_else(|| DEFAULT_SLACK_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            request_timeout: Duration::from_secs(
                self.request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            dedup_window: Duration::from_secs(
                self.dedup_window_secs.unwrap_or(DEFAULT_DEDUP_WINDOW_SECS),
            ),
            dedup_capacity: self.dedup_capacity.unwrap_or(DEFAULT_DEDUP_CAPACITY),
        };

        config.validate()?;
        Ok(config)
    }
}

fn required(name: &str, value: Option<String>) -> BridgeResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(BridgeError::Configuration(format!(
            "{} not set ({} in config file)",
            name,
            name.to_ascii_lowercase()
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: Option<String>) -> BridgeResult<Option<T>> {
    value
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| {
                BridgeError::Configuration(format!("{} must be a number, got '{}'", name, raw))
            })
        })
        .transpose()
}

fn secret(value: String) -> SecretString {
    SecretString::new(value.into())
}

impl BridgeConfig {
    /// Load configuration from environment variables.
    ///
    /// Required variables:
    /// - `SLACK_BOT_TOKEN`
    /// - `SLACK_APP_TOKEN`
    /// - `SLACK_SIGNING_SECRET`
    /// - `SLACK_BOT_USER_ID`
    /// - `WORKFLOW_ID`
    /// - `BACKEND_BASE_URL`
    /// - `BACKEND_API_KEY`
    ///
    /// Optional variables:
    /// - `SLACK_API_BASE`
    /// - `BRIDGE_REQUEST_TIMEOUT_SECS`
    /// - `BRIDGE_DEDUP_WINDOW_SECS`
    /// - `BRIDGE_DEDUP_CAPACITY`
    pub fn from_env() -> BridgeResult<Self> {
        let config = RawBridgeConfig::from_lookup(|name| std::env::var(name).ok())?.build()?;
        debug!("Loaded bridge config from environment");
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let raw: RawBridgeConfig = toml::from_str(&content).map_err(|e| {
            BridgeError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        let config = raw.build()?;
        debug!("Loaded bridge config from {}", path.display());
        Ok(config)
    }

    /// Get the bot token.
    pub fn bot_token(&self) -> &str {
        self.bot_token.expose_secret()
    }

    /// Get the app token for Socket Mode.
    pub fn app_token(&self) -> &str {
        self.app_token.expose_secret()
    }

    /// Get the signing secret.
    pub fn signing_secret(&self) -> &str {
        self.signing_secret.expose_secret()
    }

    /// Get the bot's own Slack user id.
    pub fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    /// Get the target workflow id.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Get the backend base URL (no trailing slash).
    pub fn backend_base_url(&self) -> &str {
        &self.backend_base_url
    }

    /// Get the backend bearer token.
    pub fn backend_api_key(&self) -> &str {
        self.backend_api_key.expose_secret()
    }

    /// Get the Slack Web API base URL (no trailing slash).
    pub fn slack_api_base(&self) -> &str {
        &self.slack_api_base
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn dedup_window(&self) -> Duration {
        self.dedup_window
    }

    pub fn dedup_capacity(&self) -> usize {
        self.dedup_capacity
    }

    /// Validate the configuration.
    pub fn validate(&self) -> BridgeResult<()> {
        if !self.bot_token.expose_secret().starts_with("xoxb-") {
            return Err(BridgeError::Configuration(
                "Bot token must start with 'xoxb-'".to_string(),
            ));
        }
        if !self.app_token.expose_secret().starts_with("xapp-") {
            return Err(BridgeError::Configuration(
                "App token must start with 'xapp-'".to_string(),
            ));
        }
        if !self.backend_base_url.starts_with("http://")
            && !self.backend_base_url.starts_with("https://")
        {
            return Err(BridgeError::Configuration(format!(
                "Backend base URL must be http(s), got '{}'",
                self.backend_base_url
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(BridgeError::Configuration(
                "Request timeout must be greater than zero".to_string(),
            ));
        }
        if self.dedup_capacity == 0 {
            warn!("Dedup capacity is 0, redelivered events will not be suppressed");
        }

        Ok(())
    }
}
