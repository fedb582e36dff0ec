//! Platform user to backend user resolution.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{ProvisionOutcome, WorkflowBackend};
use crate::error::{BackendError, BridgeError, BridgeResult, ProvisionedResource};

/// Maps a Slack user id to a backend user id with create-or-fetch semantics.
pub struct IdentityResolver {
    backend: Arc<dyn WorkflowBackend>,
}

impl IdentityResolver {
    pub fn new(backend: Arc<dyn WorkflowBackend>) -> Self {
        Self { backend }
    }

    /// Resolve the backend user for `external_id`, creating it if needed.
    ///
    /// "Created" and "already exists" are both success. A conflict that does
    /// not carry the canonical id is re-fetched once by repeating the call.
    pub async fn resolve_user(
        &self,
        external_id: &str,
        metadata: &serde_json::Value,
    ) -> BridgeResult<String> {
        let outcome = self
            .backend
            .create_user(external_id, metadata)
            .await
            .map_err(provisioning_error)?;

        if let Some(id) = outcome.id() {
            log_outcome(external_id, &outcome);
            return Ok(id.to_string());
        }

        warn!(
            "User {} exists but backend returned no id, re-fetching",
            external_id
        );
        let outcome = self
            .backend
            .create_user(external_id, metadata)
            .await
            .map_err(provisioning_error)?;

        outcome.id().map(str::to_string).ok_or_else(|| {
            provisioning_error(BackendError::InvalidResponse(format!(
                "no canonical id for user {}",
                external_id
            )))
        })
    }
}

fn log_outcome(external_id: &str, outcome: &ProvisionOutcome) {
    match outcome {
        ProvisionOutcome::Created { id } => debug!("Created user {} for {}", id, external_id),
        ProvisionOutcome::AlreadyExists { id } => {
            debug!("User {:?} already exists for {}", id, external_id)
        }
    }
}

fn provisioning_error(source: BackendError) -> BridgeError {
    BridgeError::Provisioning {
        resource: ProvisionedResource::User,
        source,
    }
}
