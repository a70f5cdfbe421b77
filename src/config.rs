use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{Level, info};

use crate::core::mapper::AgentMessage;

pub const DEFAULT_CONFIG_PATH: &str = "langreplay.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub runs: RunsConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    /// Baseline conversation prepended to runs that ask for it. Human string
    /// content may carry `{key}` placeholders.
    #[serde(default)]
    pub messages: Vec<AgentMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseBackend {
    /// A local SQLite file at `path`.
    #[default]
    Sqlite,
    /// A PostgreSQL server at `url`, shared by every process.
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: DatabaseBackend,

    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Connection string for the postgres backend.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_host")]
    pub host: String,

    #[serde(default = "default_http_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_url")]
    pub url: String,

    #[serde(default = "default_queue_stream")]
    pub stream: String,

    #[serde(default = "default_queue_subject")]
    pub subject: String,

    #[serde(default = "default_queue_consumer")]
    pub consumer: String,

    /// How long the broker waits for an ack before redelivering.
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Process runs on a task inside the HTTP server.
    #[default]
    InProcess,
    /// Publish runs to the queue for a `consume` process to pick up.
    Queue,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunsConfig {
    #[serde(default)]
    pub dispatch: DispatchMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Endpoint of the HTTP agent. Without it runs can only replay tools.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_tools_dir")]
    pub dir: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_database_path() -> PathBuf {
    PathBuf::from("data/runs.db")
}
fn default_max_connections() -> u32 {
    5
}
fn default_http_host() -> String {
    "127.0.0.1".to_string()
}
fn default_http_port() -> u16 {
    3000
}
fn default_queue_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}
fn default_queue_stream() -> String {
    "RUNS".to_string()
}
fn default_queue_subject() -> String {
    "runs.process".to_string()
}
fn default_queue_consumer() -> String {
    "run-processor".to_string()
}
fn default_ack_wait_secs() -> u64 {
    30 * 60
}
fn default_agent_timeout_secs() -> u64 {
    300
}
fn default_tools_dir() -> PathBuf {
    PathBuf::from("tools")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database: DatabaseConfig::default(),
            http: HttpConfig::default(),
            queue: QueueConfig::default(),
            runs: RunsConfig::default(),
            agent: AgentConfig::default(),
            tools: ToolsConfig::default(),
            messages: Vec::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::default(),
            path: default_database_path(),
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: default_queue_url(),
            stream: default_queue_stream(),
            subject: default_queue_subject(),
            consumer: default_queue_consumer(),
            ack_wait_secs: default_ack_wait_secs(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_agent_timeout_secs(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            dir: default_tools_dir(),
        }
    }
}

impl AppConfig {
    /// Loads the config file, falling back to defaults when it does not exist.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No {} found, using default configuration.", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("invalid configuration in {}", path.display()))?;

        info!(
            "Loaded config: database={:?}, http={}:{}, dispatch={:?}, baseline messages={}",
            config.database.backend,
            config.http.host,
            config.http.port,
            config.runs.dispatch,
            config.messages.len()
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// The configured log level, `INFO` when it does not name a level.
    pub fn log_level(&self) -> Level {
        Level::from_str(self.log_level.trim()).unwrap_or(Level::INFO)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.timeout_secs)
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.queue.ack_wait_secs)
    }

    /// Connection string of the postgres backend; required when that backend is selected.
    pub fn database_url(&self) -> Result<&str> {
        self.database
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .context("database.url is required when database.backend is \"postgres\"")
    }
}
