//! Single workflow invocation per inbound event.

use std::sync::Arc;

use tracing::debug;

use crate::backend::{WorkflowBackend, WorkflowInput};
use crate::error::{BridgeError, BridgeResult};
use crate::history::ConversationTurn;

/// Stage a turn has reached. Turns move strictly forward; any error jumps to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStage {
    Received,
    IdentityResolved,
    SessionResolved,
    HistoryBuilt,
    Invoked,
    Replied,
    Failed,
}

impl std::fmt::Display for TurnStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TurnStage::Received => "received",
            TurnStage::IdentityResolved => "identity_resolved",
            TurnStage::SessionResolved => "session_resolved",
            TurnStage::HistoryBuilt => "history_built",
            TurnStage::Invoked => "invoked",
            TurnStage::Replied => "replied",
            TurnStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Stateless executor: one backend call, no retries, no deduplication.
pub struct TurnExecutor {
    backend: Arc<dyn WorkflowBackend>,
}

impl TurnExecutor {
    pub fn new(backend: Arc<dyn WorkflowBackend>) -> Self {
        Self { backend }
    }

    /// Run the workflow for one turn.
    ///
    /// Returns `Ok(None)` when the workflow succeeded but produced no usable
    /// assistant message.
    pub async fn execute_turn(
        &self,
        workflow_id: &str,
        session_id: &str,
        current_message: &str,
        history: Vec<ConversationTurn>,
    ) -> BridgeResult<Option<String>> {
        let input = WorkflowInput {
            user_message: current_message.to_string(),
            session_id: session_id.to_string(),
            message_history: history,
        };
        debug!(
            "Invoking workflow {} for session {} with {} prior turn(s)",
            workflow_id,
            session_id,
            input.message_history.len()
        );

        let output = self
            .backend
            .run_workflow(workflow_id, &input)
            .await
            .map_err(BridgeError::Invocation)?;

        Ok(output
            .assistant_message
            .filter(|message| !message.trim().is_empty()))
    }
}
