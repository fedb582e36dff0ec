//! HTTP client for the workflow backend.
//!
//! Endpoints:
//! - `POST /user/` - create-or-fetch a user (200 created, 409 exists)
//! - `POST /session/` - create-or-fetch a session (200 created, 409 exists)
//! - `POST /wf/{workflow_id}/run/?run_type=blocking` - run one turn
//!
//! Status-code idempotency is surfaced as [`ProvisionOutcome`] so callers
//! never inspect status codes themselves.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

use crate::config::BridgeConfig;
use crate::error::{BackendError, BackendResult};
use crate::history::ConversationTurn;

const MAX_ERROR_BODY_CHARS: usize = 512;

/// Result of a create-or-fetch provisioning call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The record was created by this call.
    Created { id: String },
    /// The record already existed. `id` is the canonical id when the backend reported it.
    AlreadyExists { id: Option<String> },
}

impl ProvisionOutcome {
    /// Canonical id carried by the outcome, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            ProvisionOutcome::Created { id } => Some(id),
            ProvisionOutcome::AlreadyExists { id } => id.as_deref(),
        }
    }
}

/// Input of a single workflow turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowInput {
    pub user_message: String,
    pub session_id: String,
    pub message_history: Vec<ConversationTurn>,
}

/// Output of a single workflow turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowOutput {
    /// `output_node.assistant_message`, if present.
    pub assistant_message: Option<String>,
}

/// Backend operations the bridge depends on.
#[async_trait]
pub trait WorkflowBackend: Send + Sync {
    /// Create the user for `external_id`, or report that it exists.
    async fn create_user(
        &self,
        external_id: &str,
        metadata: &serde_json::Value,
    ) -> BackendResult<ProvisionOutcome>;

    /// Create the session for `(workflow_id, external_id)`, or report that it exists.
    async fn create_session(
        &self,
        workflow_id: &str,
        user_id: &str,
        external_id: &str,
    ) -> BackendResult<ProvisionOutcome>;

    /// Run the workflow once in blocking mode.
    async fn run_workflow(
        &self,
        workflow_id: &str,
        input: &WorkflowInput,
    ) -> BackendResult<WorkflowOutput>;
}

/// reqwest-backed [`WorkflowBackend`].
#[derive(Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl BackendClient {
    /// Create a client from the bridge configuration.
    pub fn new(config: &BridgeConfig) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| BackendError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.backend_base_url().to_string(),
            api_key: config.backend_api_key().to_string(),
        })
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> BackendResult<(StatusCode, serde_json::Value)> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() && status != StatusCode::CONFLICT {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: truncate(&text),
            });
        }

        let json = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(json) => json,
            // A conflict only has to say "exists"; the id is optional.
            Err(_) if status == StatusCode::CONFLICT || text.trim().is_empty() => {
                serde_json::Value::Null
            }
            Err(e) => {
                return Err(BackendError::InvalidResponse(format!(
                    "{}: {}",
                    e,
                    truncate(&text)
                )));
            }
        };
        Ok((status, json))
    }

    async fn provision(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> BackendResult<ProvisionOutcome> {
        let (status, json) = self.post(path, body).await?;

        match status {
            StatusCode::OK | StatusCode::CREATED => {
                let id = extract_id(&json).ok_or_else(|| {
                    BackendError::InvalidResponse(format!("{} response missing id", path))
                })?;
                Ok(ProvisionOutcome::Created { id })
            }
            StatusCode::CONFLICT => Ok(ProvisionOutcome::AlreadyExists {
                id: extract_id(&json),
            }),
            other => Err(BackendError::Status {
                status: other.as_u16(),
                body: truncate(&json.to_string()),
            }),
        }
    }
}

#[async_trait]
impl WorkflowBackend for BackendClient {
    async fn create_user(
        &self,
        external_id: &str,
        metadata: &serde_json::Value,
    ) -> BackendResult<ProvisionOutcome> {
        self.provision(
            "/user/",
            &serde_json::json!({
                "external_id": external_id,
                "user_metadata": metadata,
            }),
        )
        .await
    }

    async fn create_session(
        &self,
        workflow_id: &str,
        user_id: &str,
        external_id: &str,
    ) -> BackendResult<ProvisionOutcome> {
        self.provision(
            "/session/",
            &serde_json::json!({
                "workflow_id": workflow_id,
                "user_id": user_id,
                "external_id": external_id,
            }),
        )
        .await
    }

    async fn run_workflow(
        &self,
        workflow_id: &str,
        input: &WorkflowInput,
    ) -> BackendResult<WorkflowOutput> {
        let path = format!(
            "/wf/{}/run/?run_type=blocking",
            urlencoding::encode(workflow_id)
        );
        let body = serde_json::json!({
            "initial_inputs": {
                "input_node": input,
            }
        });

        let (status, json) = self.post(&path, &body).await?;
        if status != StatusCode::OK {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: truncate(&json.to_string()),
            });
        }

        let assistant_message = json
            .get("output_node")
            .and_then(|node| node.get("assistant_message"))
            .and_then(|message| message.as_str())
            .map(str::to_string);
        Ok(WorkflowOutput { assistant_message })
    }
}

/// Backend ids come back as strings or numbers; normalize to a string.
fn extract_id(json: &serde_json::Value) -> Option<String> {
    match json.get("id")? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_ERROR_BODY_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_ERROR_BODY_CHARS).collect();
    out.push('…');
    out
}
