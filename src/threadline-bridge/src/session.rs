//! Slack thread to backend session resolution.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{ProvisionOutcome, WorkflowBackend};
use crate::error::{BackendError, BridgeError, BridgeResult, ProvisionedResource};

/// Maps a thread key to a backend session, one session per `(workflow, thread)`.
pub struct SessionResolver {
    backend: Arc<dyn WorkflowBackend>,
}

impl SessionResolver {
    pub fn new(backend: Arc<dyn WorkflowBackend>) -> Self {
        Self { backend }
    }

    /// Resolve the session for `thread_key` in `workflow_id`, creating it if needed.
    pub async fn resolve_session(
        &self,
        workflow_id: &str,
        user_id: &str,
        thread_key: &str,
    ) -> BridgeResult<String> {
        let outcome = self
            .backend
            .create_session(workflow_id, user_id, thread_key)
            .await
            .map_err(provisioning_error)?;

        match &outcome {
            ProvisionOutcome::Created { id } => {
                debug!("Created session {} for thread {}", id, thread_key);
                return Ok(id.clone());
            }
            ProvisionOutcome::AlreadyExists { id: Some(id) } => {
                debug!("Reusing session {} for thread {}", id, thread_key);
                return Ok(id.clone());
            }
            ProvisionOutcome::AlreadyExists { id: None } => {
                warn!(
                    "Session for thread {} exists but backend returned no id, re-fetching",
                    thread_key
                );
            }
        }

        let outcome = self
            .backend
            .create_session(workflow_id, user_id, thread_key)
            .await
            .map_err(provisioning_error)?;

        outcome.id().map(str::to_string).ok_or_else(|| {
            provisioning_error(BackendError::InvalidResponse(format!(
                "no canonical id for session of thread {}",
                thread_key
            )))
        })
    }
}

fn provisioning_error(source: BackendError) -> BridgeError {
    BridgeError::Provisioning {
        resource: ProvisionedResource::Session,
        source,
    }
}
