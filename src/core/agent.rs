use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::core::mapper::AgentMessage;
use crate::core::runner::replay::ReplaySink;

/// Everything the agent receives to continue a run.
pub struct AgentRequest {
    pub run_id: String,
    pub messages: Vec<AgentMessage>,
    /// Where the agent records the messages it produces while running.
    pub replay_sink: ReplaySink,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    #[serde(default)]
    pub messages: Option<Vec<AgentMessage>>,
}

/// The external agent that continues a run.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentOutcome>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentPayload<'a> {
    run_id: &'a str,
    messages: &'a [AgentMessage],
}

/// Agent reached over HTTP. The conversation is POSTed as
/// `{"runId", "messages"}` and the reply is an [`AgentOutcome`].
pub struct HttpAgent {
    client: reqwest::Client,
    url: String,
}

impl HttpAgent {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build agent HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AgentInvoker for HttpAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentOutcome> {
        info!(run_id = %request.run_id, url = %self.url, "Invoking agent");
        let response = self
            .client
            .post(&self.url)
            .json(&AgentPayload {
                run_id: &request.run_id,
                messages: &request.messages,
            })
            .send()
            .await
            .with_context(|| format!("agent at {} is unreachable", self.url))?
            .error_for_status()?;

        let outcome: AgentOutcome = response
            .json()
            .await
            .context("agent reply is not a valid outcome")?;

        if let Some(messages) = &outcome.messages {
            let ids = request.replay_sink.on_run_extended(messages).await?;
            debug!(run_id = %request.run_id, recorded = ids.len(), "Agent messages recorded");
        }
        Ok(outcome)
    }
}
