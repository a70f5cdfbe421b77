use crate::core::model::RunStatus;

/// Errors raised by the store, the tool loop and the run processor.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Invalid message at index {index}: {reason}")]
    Validation { index: usize, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error(
        "Tool {name} does not exist in the list of tools: {}",
        available.join(", ")
    )]
    ToolNotFound {
        name: String,
        available: Vec<String>,
    },

    #[error("Invalid run status transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("No agent is configured to continue the run")]
    AgentUnavailable,

    #[error("Agent invocation failed: {0:#}")]
    Agent(#[source] anyhow::Error),

    /// A tool invocation failed. Displays the tool's own error text.
    #[error("{source}")]
    Tool {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    pub fn run_not_found(run_id: &str) -> Self {
        Self::NotFound(format!("Run {run_id}"))
    }

    pub fn message_not_found(run_id: &str, message_id: &str) -> Self {
        Self::NotFound(format!("Message {message_id} of run {run_id}"))
    }

    /// True for errors caused by the caller's input rather than the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::ToolNotFound { .. })
    }
}
