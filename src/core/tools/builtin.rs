use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::{Tool, ToolContext};

/// Returns its input unchanged.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Returns the input it was called with"
    }

    async fn invoke(&self, _ctx: &mut ToolContext, input: Value) -> Result<Value> {
        Ok(input)
    }
}

/// Merges an object input into the shared tool context and returns the
/// resulting context. A string input reads that single key.
pub struct ContextTool;

#[async_trait]
impl Tool for ContextTool {
    fn name(&self) -> &str {
        "context"
    }

    fn description(&self) -> &str {
        "Reads or updates the context shared by tools of a run"
    }

    async fn invoke(&self, ctx: &mut ToolContext, input: Value) -> Result<Value> {
        match input {
            Value::Object(patch) => {
                ctx.update(patch);
                Ok(Value::Object(ctx.snapshot()))
            }
            Value::String(key) => Ok(ctx.get(&key).cloned().unwrap_or(Value::Null)),
            other => Err(anyhow::anyhow!(
                "context expects an object or a key, got {}",
                other
            )),
        }
    }
}
