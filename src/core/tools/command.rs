use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use super::{Tool, ToolContext};

/// `manifest.toml` of a tool directory.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,

    // Script run for each call, relative to the tool directory
    #[serde(default = "default_entrypoint")]
    pub entrypoint: String,

    #[serde(default = "default_run_command")]
    pub run_command: String,

    #[serde(skip)]
    pub tool_dir: PathBuf,
}

fn default_entrypoint() -> String {
    "run.sh".to_string()
}

fn default_run_command() -> String {
    "sh".to_string()
}

/// A tool backed by a script on the host.
///
/// The call input is written to stdin as JSON and the context snapshot is
/// exported in `TOOL_CONTEXT`. Stdout is parsed as JSON when possible and
/// returned as a string otherwise.
pub struct CommandTool {
    manifest: CommandManifest,
}

impl CommandTool {
    pub fn new(manifest: CommandManifest) -> Self {
        Self { manifest }
    }

    pub fn manifest(&self) -> &CommandManifest {
        &self.manifest
    }
}

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn description(&self) -> &str {
        &self.manifest.description
    }

    async fn invoke(&self, ctx: &mut ToolContext, input: Value) -> Result<Value> {
        let script_path = self.manifest.tool_dir.join(&self.manifest.entrypoint);
        if !script_path.exists() {
            return Err(anyhow::anyhow!(
                "Tool entrypoint not found at {:?}",
                script_path
            ));
        }

        let mut cmd = Command::new(&self.manifest.run_command);
        cmd.arg(&script_path)
            .current_dir(&self.manifest.tool_dir)
            .env("TOOL_NAME", &self.manifest.name)
            .env("TOOL_CONTEXT", serde_json::to_string(&ctx.snapshot())?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let payload = serde_json::to_string(&input)?;
        if let Some(mut stdin) = child.stdin.take() {
            // Scripts that never read stdin may exit before the write lands.
            let _ = stdin.write_all(payload.as_bytes()).await;
            drop(stdin);
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!(
                "Tool {} exited with {}: {}",
                self.manifest.name,
                output.status,
                err.trim()
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
    }
}

/// Loads every `<dir>/<tool>/manifest.toml`. Unreadable manifests are skipped with a warning.
pub async fn load_command_tools<P: AsRef<Path>>(dir_path: P) -> Result<Vec<CommandTool>> {
    let path = dir_path.as_ref();
    if !path.is_dir() {
        warn!("Tools directory not found at {:?}", path);
        return Ok(Vec::new());
    }

    let mut tools = Vec::new();
    let mut entries = fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let tool_dir = entry.path();
        let manifest_path = tool_dir.join("manifest.toml");
        if !tool_dir.is_dir() || !manifest_path.exists() {
            continue;
        }

        match fs::read_to_string(&manifest_path).await {
            Ok(contents) => match toml::from_str::<CommandManifest>(&contents) {
                Ok(mut manifest) => {
                    manifest.tool_dir = tool_dir.clone();
                    info!("Loaded command tool [{}]", manifest.name);
                    tools.push(CommandTool::new(manifest));
                }
                Err(e) => warn!("Failed to parse manifest at {:?}: {}", manifest_path, e),
            },
            Err(e) => warn!("Failed to read manifest at {:?}: {}", manifest_path, e),
        }
    }

    tools.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
    Ok(tools)
}
