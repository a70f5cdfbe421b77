mod error;
mod handlers;
mod router;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::core::lifecycle::LifecycleComponent;
use crate::core::mapper::AgentMessage;
use crate::core::store::RunStore;
use crate::core::tools::ToolRegistry;
use crate::interfaces::dispatch::RunDispatcher;

pub use error::ApiError;
pub use router::build_api_router;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub tools: Arc<ToolRegistry>,
    pub dispatcher: RunDispatcher,
    /// Configured baseline conversation, templated per run.
    pub baseline_messages: Arc<Vec<AgentMessage>>,
}

pub struct ApiServer {
    state: AppState,
    host: String,
    port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ApiServer {
    pub fn new(state: AppState, host: impl Into<String>, port: u16) -> Self {
        Self {
            state,
            host: host.into(),
            port,
            shutdown_tx: None,
        }
    }
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API Server Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind API server to {addr}: {e}"))?;
        let app = build_api_router(self.state.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        tokio::spawn(async move {
            info!("API Server running at http://{addr}");
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("API Server error: {}", e);
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server shutting down...");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}
