pub mod builtin;
pub mod command;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::error::RunError;
use crate::core::model::ToolCall;

/// Shared key/value state visible to every tool of a registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolContext {
    values: Map<String, Value>,
}

impl ToolContext {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Merges `patch` into the context, overwriting existing keys.
    pub fn update(&mut self, patch: Map<String, Value>) {
        self.values.extend(patch);
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.clone()
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn invoke(&self, ctx: &mut ToolContext, input: Value) -> Result<Value>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_call_name: String,
    pub result: Value,
}

/// Ordered set of named tools. A name may be registered without an
/// implementation, in which case calling it fails as an unknown tool.
pub struct ToolRegistry {
    entries: Vec<(String, Option<Arc<dyn Tool>>)>,
    context: Mutex<ToolContext>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            context: Mutex::new(ToolContext::default()),
        }
    }

    pub fn with_context(context: ToolContext) -> Self {
        Self {
            entries: Vec::new(),
            context: Mutex::new(context),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.insert(name, Some(tool));
    }

    /// Lists a tool name with no implementation behind it.
    pub fn register_unavailable(&mut self, name: impl Into<String>) {
        self.insert(name.into(), None);
    }

    fn insert(&mut self, name: String, tool: Option<Arc<dyn Tool>>) {
        if let Some(entry) = self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            warn!("Tool {} registered twice, keeping the latest", name);
            entry.1 = tool;
        } else {
            self.entries.push((name, tool));
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .and_then(|(_, tool)| tool.clone())
    }

    pub async fn context_snapshot(&self) -> Map<String, Value> {
        self.context.lock().await.snapshot()
    }

    /// Runs the calls one after another, in order, against the shared context.
    ///
    /// Stops at the first unknown tool or failing invocation. Calls already
    /// made are not rolled back.
    pub async fn execute_tool_calls(&self, calls: &[ToolCall]) -> Result<Vec<ToolResult>, RunError> {
        let mut results = Vec::with_capacity(calls.len());
        let mut ctx = self.context.lock().await;

        for call in calls {
            let Some(tool) = self.resolve(&call.name) else {
                return Err(RunError::ToolNotFound {
                    name: call.name.clone(),
                    available: self.names(),
                });
            };

            info!("Replaying tool call [{}]", call.name);
            let result = tool
                .invoke(&mut ctx, call.args.input.clone())
                .await
                .map_err(|source| RunError::Tool {
                    name: call.name.clone(),
                    source,
                })?;
            results.push(ToolResult {
                tool_call_name: call.name.clone(),
                result,
            });
        }

        Ok(results)
    }
}
