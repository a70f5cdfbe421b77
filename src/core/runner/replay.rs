use std::sync::Arc;

use tracing::debug;

use crate::core::error::RunError;
use crate::core::mapper::{AgentMessage, to_new_messages};
use crate::core::store::RunStore;

/// Appends messages produced by the agent to the run being processed.
#[derive(Clone)]
pub struct ReplaySink {
    store: Arc<dyn RunStore>,
    run_id: String,
}

impl ReplaySink {
    pub fn new(store: Arc<dyn RunStore>, run_id: impl Into<String>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Stores the messages as one batch and returns their ids.
    pub async fn on_run_extended(
        &self,
        new_messages: &[AgentMessage],
    ) -> Result<Vec<String>, RunError> {
        if new_messages.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self
            .store
            .insert_messages(&self.run_id, &to_new_messages(new_messages))
            .await?;
        debug!(run_id = %self.run_id, count = ids.len(), "Run extended");
        Ok(ids)
    }
}
