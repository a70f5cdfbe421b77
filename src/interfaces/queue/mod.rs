//! NATS JetStream front end.
//!
//! Runs are published as [`RunEnvelope`]s onto a durable work-queue stream and
//! taken off it by a durable pull consumer with explicit acks. Every delivery
//! is acknowledged once handled, whatever the outcome, so a bad envelope is
//! never redelivered by the engine itself.

use anyhow::Result;
use async_nats::jetstream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use crate::config::QueueConfig;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::model::{NewMessage, Run};
use crate::core::runner::{RunJob, RunProcessor, fail_run};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEnvelope {
    pub run_id: String,
    #[serde(default)]
    pub messages: Vec<NewMessage>,
    #[serde(default)]
    pub tools_only: bool,
}

impl From<&RunJob> for RunEnvelope {
    fn from(job: &RunJob) -> Self {
        Self {
            run_id: job.run_id.clone(),
            messages: job.messages.clone(),
            tools_only: job.tools_only,
        }
    }
}

impl From<RunEnvelope> for RunJob {
    fn from(envelope: RunEnvelope) -> Self {
        Self {
            run_id: envelope.run_id,
            messages: envelope.messages,
            tools_only: envelope.tools_only,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("nats connection error: {0}")]
    Connect(String),

    #[error("jetstream error: {0}")]
    JetStream(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

async fn connect(config: &QueueConfig) -> Result<jetstream::Context, QueueError> {
    let client = async_nats::connect(config.url.as_str())
        .await
        .map_err(|e| QueueError::Connect(e.to_string()))?;
    Ok(jetstream::new(client))
}

/// Creates the run stream if it does not exist yet.
async fn ensure_stream(
    context: &jetstream::Context,
    config: &QueueConfig,
) -> Result<jetstream::stream::Stream, QueueError> {
    context
        .get_or_create_stream(jetstream::stream::Config {
            name: config.stream.clone(),
            subjects: vec![config.subject.clone()],
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            storage: jetstream::stream::StorageType::File,
            ..Default::default()
        })
        .await
        .map_err(|e| QueueError::JetStream(e.to_string()))
}

/// Publishes run envelopes and waits for the broker to persist each one.
pub struct QueuePublisher {
    jetstream: jetstream::Context,
    subject: String,
}

impl QueuePublisher {
    pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
        let jetstream = connect(config).await?;
        ensure_stream(&jetstream, config).await?;
        info!("Queue publisher ready on subject {}", config.subject);
        Ok(Self {
            jetstream,
            subject: config.subject.clone(),
        })
    }

    pub async fn publish(&self, envelope: &RunEnvelope) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(envelope)?;
        self.jetstream
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| QueueError::JetStream(e.to_string()))?
            .await
            .map_err(|e| QueueError::JetStream(e.to_string()))?;
        info!(run_id = %envelope.run_id, "Run published to queue");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// The run reached a final state.
    Processed(Run),
    /// The run could not be processed nor marked failed.
    Abandoned { run_id: String },
    /// The payload was not a run envelope.
    Malformed(String),
}

/// Handles one delivery payload. Never fails; the caller acks afterwards.
pub async fn handle_delivery(processor: &RunProcessor, payload: &[u8]) -> DeliveryOutcome {
    let envelope: RunEnvelope = match serde_json::from_slice(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Dropping malformed run envelope: {}", e);
            return DeliveryOutcome::Malformed(e.to_string());
        }
    };

    for (index, message) in envelope.messages.iter().enumerate() {
        if let Err(reason) = message.validate() {
            let reason = format!("Invalid message at index {index}: {reason}");
            warn!(run_id = %envelope.run_id, "Rejecting run envelope: {}", reason);
            return match fail_run(processor.store().as_ref(), &envelope.run_id, &reason).await {
                Ok(run) => DeliveryOutcome::Processed(run),
                Err(e) => {
                    error!(run_id = %envelope.run_id, "Could not mark run failed: {}", e);
                    DeliveryOutcome::Abandoned {
                        run_id: envelope.run_id,
                    }
                }
            };
        }
    }

    let job = RunJob::from(envelope);
    match processor.process_or_fail(&job).await {
        Some(run) => DeliveryOutcome::Processed(run),
        None => DeliveryOutcome::Abandoned { run_id: job.run_id },
    }
}

/// Durable pull consumer feeding deliveries to the run processor one at a time.
pub struct QueueConsumer {
    processor: Arc<RunProcessor>,
    config: QueueConfig,
    ack_wait: Duration,
    consumer: Option<jetstream::consumer::PullConsumer>,
    worker: Option<JoinHandle<()>>,
}

impl QueueConsumer {
    pub fn new(processor: Arc<RunProcessor>, config: QueueConfig, ack_wait: Duration) -> Self {
        Self {
            processor,
            config,
            ack_wait,
            consumer: None,
            worker: None,
        }
    }
}

async fn consume(processor: Arc<RunProcessor>, consumer: jetstream::consumer::PullConsumer) {
    let mut messages = match consumer.messages().await {
        Ok(messages) => messages,
        Err(e) => {
            error!("Queue consumer could not subscribe: {}", e);
            return;
        }
    };

    while let Some(delivery) = messages.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!("Queue delivery error: {}", e);
                continue;
            }
        };

        match handle_delivery(&processor, &delivery.payload).await {
            DeliveryOutcome::Processed(run) => {
                info!(run_id = %run.id, status = %run.status, "Delivery handled")
            }
            DeliveryOutcome::Abandoned { run_id } => {
                warn!(run_id = %run_id, "Delivery abandoned")
            }
            DeliveryOutcome::Malformed(_) => {}
        }

        if let Err(e) = delivery.ack().await {
            error!("Failed to ack delivery: {}", e);
        }
    }
    warn!("Queue delivery stream closed");
}

/// Durable pull consumer settings. A run is delivered once: a delivery whose
/// ack window lapses mid-run is not handed to a second worker.
pub(crate) fn consumer_config(config: &QueueConfig, ack_wait: Duration) -> jetstream::consumer::pull::Config {
    jetstream::consumer::pull::Config {
        durable_name: Some(config.consumer.clone()),
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        ack_wait,
        max_deliver: 1,
        filter_subject: config.subject.clone(),
        ..Default::default()
    }
}

#[async_trait]
impl LifecycleComponent for QueueConsumer {
    async fn on_init(&mut self) -> Result<()> {
        info!("Queue consumer connecting to {}...", self.config.url);
        let context = connect(&self.config).await?;
        let stream = ensure_stream(&context, &self.config).await?;
        let consumer = stream
            .get_or_create_consumer(
                &self.config.consumer,
                consumer_config(&self.config, self.ack_wait),
            )
            .await
            .map_err(|e| QueueError::JetStream(e.to_string()))?;
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let Some(consumer) = self.consumer.take() else {
            return Err(anyhow::anyhow!("queue consumer started before init"));
        };
        info!(
            "Queue consumer [{}] listening on {}",
            self.config.consumer, self.config.subject
        );
        self.worker = Some(tokio::spawn(consume(self.processor.clone(), consumer)));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("Queue consumer shutting down...");
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
        Ok(())
    }
}
