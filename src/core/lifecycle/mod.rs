use anyhow::Result;
use tracing::{info, warn};

/// Long-running front end driven by the CLI: initialized, started, then shut
/// down on Ctrl+C.
#[async_trait::async_trait]
pub trait LifecycleComponent {
    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Ready,
    Shutdown,
}

/// Drives attached components through init, start and shutdown in order.
pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Box<dyn LifecycleComponent + Send>>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Init,
            components: Vec::new(),
        }
    }

    pub fn attach(&mut self, component: Box<dyn LifecycleComponent + Send>) {
        self.components.push(component);
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Initializes every component, then starts them. Stops at the first error.
    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &mut self.components {
            comp.on_init().await?;
        }

        for comp in &mut self.components {
            comp.on_start().await?;
        }

        info!("Lifecycle Phase: Ready");
        self.state = LifecycleState::Ready;
        Ok(())
    }

    /// Shuts components down in reverse order. Errors are logged, not returned.
    pub async fn shutdown(&mut self) {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;
        for comp in self.components.iter_mut().rev() {
            if let Err(e) = comp.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }
    }
}
