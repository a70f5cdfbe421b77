pub(crate) mod terminal;

use anyhow::{Result, anyhow};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;

use langreplay::config::{AppConfig, DEFAULT_CONFIG_PATH, DatabaseBackend, DispatchMode};
use langreplay::core::agent::HttpAgent;
use langreplay::core::lifecycle::LifecycleManager;
use langreplay::core::runner::RunProcessor;
use langreplay::core::store::{PostgresRunStore, RunStore, SqliteRunStore};
use langreplay::core::tools::ToolRegistry;
use langreplay::core::tools::builtin::{ContextTool, EchoTool};
use langreplay::core::tools::command::load_command_tools;
use langreplay::interfaces::dispatch::RunDispatcher;
use langreplay::interfaces::queue::{QueueConsumer, QueuePublisher};
use langreplay::interfaces::web::{ApiServer, AppState};
use langreplay::logging;

use terminal::CommandSection;

fn print_help() {
    terminal::print_banner();

    CommandSection::new("Commands")
        .command("serve", "Start the HTTP API")
        .command("consume", "Process runs from the queue")
        .command("help", "Show this help")
        .print();

    CommandSection::new("Options")
        .command("--config <path>", "Config file (default: langreplay.toml)")
        .command("--host <host>", "Bind address for serve")
        .command("--port <port>", "Listen port for serve")
        .print();

    println!(
        " {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("langreplay").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServeFlags {
    pub config: PathBuf,
    pub host: Option<String>,
    pub port: Option<u16>,
}

pub(crate) fn parse_serve_flags(args: &[String], start: usize) -> ServeFlags {
    let mut config = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut host = None;
    let mut port = None;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config = PathBuf::from(&args[i + 1]);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--host" => {
                if i + 1 < args.len() {
                    host = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port = args[i + 1].parse().ok();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    ServeFlags { config, host, port }
}

pub(crate) fn parse_config_flag(args: &[String], start: usize) -> PathBuf {
    parse_serve_flags(args, start).config
}

async fn load_config(path: &PathBuf) -> Result<AppConfig> {
    let config = AppConfig::load(path).await?;
    logging::init(config.log_level());
    Ok(config)
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn RunStore>> {
    match config.database.backend {
        DatabaseBackend::Sqlite => {
            terminal::print_status("Database", &config.database.path.display().to_string());
            Ok(Arc::new(SqliteRunStore::open(&config.database.path).await?))
        }
        DatabaseBackend::Postgres => {
            terminal::print_status("Database", "postgres");
            let store =
                PostgresRunStore::connect(config.database_url()?, config.database.max_connections)
                    .await?;
            Ok(Arc::new(store))
        }
    }
}

/// Opens the store, registers tools and attaches the agent when one is configured.
async fn build_processor(config: &AppConfig) -> Result<Arc<RunProcessor>> {
    let store = open_store(config).await?;

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));
    tools.register(Arc::new(ContextTool));
    for tool in load_command_tools(&config.tools.dir).await? {
        tools.register(Arc::new(tool));
    }
    terminal::print_status("Tools", &tools.names().join(", "));

    let mut processor = RunProcessor::new(store, Arc::new(tools));
    match &config.agent.url {
        Some(url) => {
            terminal::print_status("Agent", url);
            let agent = HttpAgent::new(url.clone(), config.agent_timeout())?;
            processor = processor.with_agent(Arc::new(agent));
        }
        None => terminal::print_warn("No agent configured, only toolsOnly runs can succeed"),
    }
    Ok(Arc::new(processor))
}

async fn serve(flags: ServeFlags) -> Result<()> {
    let mut config = load_config(&flags.config).await?;
    if let Some(host) = flags.host {
        config.http.host = host;
    }
    if let Some(port) = flags.port {
        config.http.port = port;
    }

    let processor = build_processor(&config).await?;
    let dispatcher = match config.runs.dispatch {
        DispatchMode::InProcess => RunDispatcher::InProcess(processor.clone()),
        DispatchMode::Queue => {
            terminal::print_status("Queue", &config.queue.url);
            RunDispatcher::Queue {
                publisher: Arc::new(QueuePublisher::connect(&config.queue).await?),
                processor: processor.clone(),
            }
        }
    };
    let state = AppState {
        store: processor.store().clone(),
        tools: processor.tools().clone(),
        dispatcher,
        baseline_messages: Arc::new(config.messages.clone()),
    };

    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(Box::new(ApiServer::new(
        state,
        config.http.host.clone(),
        config.http.port,
    )));
    lifecycle.start().await?;

    terminal::print_success("langreplay is serving");
    terminal::print_link(
        "API",
        &format!("http://{}:{}", config.http.host, config.http.port),
    );
    terminal::print_info(&format!("Press {} to stop", style("Ctrl+C").bold().yellow()));

    tokio::signal::ctrl_c().await?;
    lifecycle.shutdown().await;
    Ok(())
}

async fn consume(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path).await?;
    let processor = build_processor(&config).await?;
    terminal::print_status("Queue", &config.queue.url);

    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(Box::new(QueueConsumer::new(
        processor,
        config.queue.clone(),
        config.ack_wait(),
    )));
    lifecycle.start().await?;

    terminal::print_success(&format!(
        "Consuming runs from {}",
        style(&config.queue.subject).cyan()
    ));
    terminal::print_info(&format!("Press {} to stop", style("Ctrl+C").bold().yellow()));

    tokio::signal::ctrl_c().await?;
    lifecycle.shutdown().await;
    Ok(())
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("serve") => serve(parse_serve_flags(&args, 2)).await,
        Some("consume") => consume(parse_config_flag(&args, 2)).await,
        None | Some("help") | Some("--help") | Some("-h") => {
            print_help();
            Ok(())
        }
        Some(other) => {
            print_help();
            Err(anyhow!("Unknown command: {other}"))
        }
    }
}
