pub mod replay;
pub mod task_status;

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::core::agent::{AgentInvoker, AgentRequest};
use crate::core::error::RunError;
use crate::core::mapper::to_agent_messages;
use crate::core::model::{FAILED_TASK_STATUS, NewMessage, Run, RunStatus};
use crate::core::store::RunStore;
use crate::core::tools::ToolRegistry;

use self::replay::ReplaySink;
pub use self::task_status::{TaskAssessment, evaluate_task_prompt, extract_task_status};

/// Reason recorded when a run fails outside of the processor's own handling.
pub const PROCESSING_FAILED_REASON: &str = "Processing failed";

/// One unit of work: a run plus the messages that drive it.
#[derive(Debug, Clone, PartialEq)]
pub struct RunJob {
    pub run_id: String,
    pub messages: Vec<NewMessage>,
    /// Replay tool calls only; the agent is not invoked.
    pub tools_only: bool,
}

/// Drives a run from `scheduled` to `done` or `failed`.
pub struct RunProcessor {
    store: Arc<dyn RunStore>,
    tools: Arc<ToolRegistry>,
    agent: Option<Arc<dyn AgentInvoker>>,
}

impl RunProcessor {
    pub fn new(store: Arc<dyn RunStore>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            store,
            tools,
            agent: None,
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn AgentInvoker>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Processes the job and returns the run in its final state.
    ///
    /// Failures of tool replay or the agent end the run as `failed` with the
    /// error text as reason and are not returned. Only storage errors while
    /// recording the outcome surface as `Err`.
    pub async fn process(&self, job: &RunJob) -> Result<Run, RunError> {
        self.store
            .update_run_status(&job.run_id, RunStatus::Running)
            .await?;
        info!(
            run_id = %job.run_id,
            messages = job.messages.len(),
            tools_only = job.tools_only,
            "Run started"
        );

        match self.execute(job).await {
            Ok(assessment) => {
                self.store
                    .update_run_status(&job.run_id, RunStatus::Done)
                    .await?;
                let run = self
                    .store
                    .update_run_task_status(
                        &job.run_id,
                        &assessment.task_status,
                        Some(&assessment.reason),
                    )
                    .await?;
                info!(run_id = %job.run_id, task_status = %run.task_status, "Run done");
                Ok(run)
            }
            Err(err) => {
                error!(run_id = %job.run_id, "Run failed: {}", err);
                self.store
                    .update_run_status(&job.run_id, RunStatus::Failed)
                    .await?;
                self.store
                    .update_run_task_status(&job.run_id, FAILED_TASK_STATUS, Some(&err.to_string()))
                    .await
            }
        }
    }

    async fn execute(&self, job: &RunJob) -> Result<TaskAssessment, RunError> {
        for message in job.messages.iter().filter(|m| m.has_tool_calls()) {
            let calls = message.tool_calls.as_deref().unwrap_or_default();
            let results = self.tools.execute_tool_calls(calls).await?;
            info!(run_id = %job.run_id, replayed = results.len(), "Tool calls replayed");
        }

        if job.tools_only {
            return Ok(TaskAssessment::default());
        }

        let agent = self.agent.as_ref().ok_or(RunError::AgentUnavailable)?;
        let request = AgentRequest {
            run_id: job.run_id.clone(),
            messages: to_agent_messages(&job.messages),
            replay_sink: ReplaySink::new(self.store.clone(), job.run_id.clone()),
        };
        let outcome = agent.invoke(request).await.map_err(RunError::Agent)?;

        Ok(extract_task_status(
            outcome.messages.as_deref().unwrap_or_default(),
        ))
    }

    /// Processes the job and never returns an error: anything that escapes
    /// [`RunProcessor::process`] marks the run failed with a generic reason.
    pub async fn process_or_fail(&self, job: &RunJob) -> Option<Run> {
        match self.process(job).await {
            Ok(run) => Some(run),
            Err(err) => {
                error!(run_id = %job.run_id, "Run processing aborted: {}", err);
                match fail_run(self.store.as_ref(), &job.run_id, PROCESSING_FAILED_REASON).await {
                    Ok(run) => Some(run),
                    Err(fail_err) => {
                        warn!(run_id = %job.run_id, "Could not mark run failed: {}", fail_err);
                        None
                    }
                }
            }
        }
    }
}

/// Moves a run to `failed` through the legal transitions and records the reason.
/// A run that already reached `done` or `failed` is returned unchanged.
pub async fn fail_run(store: &dyn RunStore, run_id: &str, reason: &str) -> Result<Run, RunError> {
    let run = store.get_run(run_id).await?;
    if run.status.is_terminal() {
        warn!(
            run_id = %run_id,
            status = %run.status,
            "Run already finished, keeping its outcome"
        );
        return Ok(run);
    }
    if run.status == RunStatus::Scheduled {
        store.update_run_status(run_id, RunStatus::Running).await?;
    }
    store.update_run_status(run_id, RunStatus::Failed).await?;
    store
        .update_run_task_status(run_id, FAILED_TASK_STATUS, Some(reason))
        .await
}
