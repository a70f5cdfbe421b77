use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::core::runner::{RunJob, RunProcessor, fail_run};
use crate::interfaces::queue::{QueuePublisher, RunEnvelope};

/// Hands accepted runs to whatever processes them.
#[derive(Clone)]
pub enum RunDispatcher {
    /// Process on a background task of this process.
    InProcess(Arc<RunProcessor>),
    /// Publish to the queue. The processor is only used to mark runs failed
    /// when publishing does not succeed.
    Queue {
        publisher: Arc<QueuePublisher>,
        processor: Arc<RunProcessor>,
    },
}

impl RunDispatcher {
    /// Handles the jobs one after another on a single background task.
    pub fn dispatch(&self, jobs: Vec<RunJob>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            for job in jobs {
                dispatcher.dispatch_one(&job).await;
            }
        })
    }

    async fn dispatch_one(&self, job: &RunJob) {
        match self {
            RunDispatcher::InProcess(processor) => {
                processor.process_or_fail(job).await;
            }
            RunDispatcher::Queue {
                publisher,
                processor,
            } => {
                if let Err(e) = publisher.publish(&RunEnvelope::from(job)).await {
                    error!(run_id = %job.run_id, "Failed to publish run: {}", e);
                    let reason = format!("Failed to publish run: {e}");
                    if let Err(fail_err) =
                        fail_run(processor.store().as_ref(), &job.run_id, &reason).await
                    {
                        error!(run_id = %job.run_id, "Could not mark run failed: {}", fail_err);
                    }
                } else {
                    info!(run_id = %job.run_id, "Run handed to queue");
                }
            }
        }
    }
}
