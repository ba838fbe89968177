//! algoforge - main entry point
//!
//! Composition root: wires the bus, key manager, router, agents, and
//! orchestrator together from configuration, then drives a TodoList to
//! convergence.

use algoforge::agents::{
    AgentRuntime, AgentRuntimeConfig, ArchitectAgent, CoderAgent, DebuggerAgent, TesterAgent,
};
use algoforge::bus::{InMemoryBus, MessageBus, MqttBus};
use algoforge::bus::mqtt::MqttBusConfig;
use algoforge::config::{BusBackend, PlatformConfig};
use algoforge::iterate::{IterativeLoop, IterativeLoopConfig};
use algoforge::keys::{KeyManager, KeyManagerConfig};
use algoforge::llm::providers::gemini::{GeminiConfig, GeminiProvider};
use algoforge::llm::HeuristicEstimator;
use algoforge::observability::{init_default_logging, HealthServer};
use algoforge::orchestrator::Orchestrator;
use algoforge::persistence::InMemoryStateStore;
use algoforge::router::{RequestRouter, RouterConfig};
use algoforge::secrets::EnvSecretStore;
use algoforge::workflow::TodoList;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Multi-agent strategy generation platform
#[derive(Parser)]
#[command(name = "algoforge")]
#[command(about = "Multi-agent orchestration for trading-strategy generation")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a TodoList document to convergence
    Run {
        /// Path to the planner's TodoList JSON document
        todolist: PathBuf,
        /// Where to write the iteration report
        #[arg(long, default_value = "iteration_report.json")]
        report: PathBuf,
    },
    /// Validate configuration
    Config {
        /// Show the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();
    info!("starting algoforge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { todolist, report } => run_platform(config, todolist, report).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("command failed: {e}");
        process::exit(1);
    }

    info!("shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<PlatformConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            Ok(PlatformConfig::load_from_file(path)?)
        }
        None => {
            for candidate in ["algoforge.toml", "config/algoforge.toml"] {
                let path = PathBuf::from(candidate);
                if path.exists() {
                    info!("loading configuration from {}", path.display());
                    return Ok(PlatformConfig::load_from_file(&path)?);
                }
            }
            Err("no configuration file found; pass one with -c/--config or create algoforge.toml".into())
        }
    }
}

fn handle_config_command(
    config: PlatformConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    println!("configuration valid: {} key(s) configured", config.keys.len());
    if show {
        // Note: the manifest holds env-var names, never credential values.
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

async fn run_platform(
    config: PlatformConfig,
    todolist_path: PathBuf,
    report_path: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    // Bus backend.
    let bus: Arc<dyn MessageBus> = match config.bus.backend {
        BusBackend::Memory => Arc::new(InMemoryBus::new()),
        BusBackend::Mqtt => {
            MqttBus::connect(MqttBusConfig {
                broker_url: config.bus.broker_url.clone(),
                ..MqttBusConfig::default()
            })
            .await?
        }
    };

    // Keys and router.
    let secrets = EnvSecretStore;
    let records = config.resolve_keys(&secrets)?;
    let request_timeout = Duration::from_secs(config.router.request_timeout_secs);
    let keys = Arc::new(KeyManager::new(
        records,
        KeyManagerConfig { request_timeout },
    )?);
    let _reaper = keys.spawn_reaper();

    let provider = Arc::new(GeminiProvider::new(GeminiConfig {
        timeout: request_timeout,
        ..GeminiConfig::default()
    })?);
    let router = Arc::new(RequestRouter::new(
        keys.clone(),
        provider,
        Box::new(HeuristicEstimator),
        RouterConfig {
            max_attempts: config.router.max_attempts,
            request_timeout,
            conversation_ttl: Duration::from_secs(config.router.conversation_ttl_secs),
            ..RouterConfig::default()
        },
    ));

    // Health endpoint.
    let health_port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(config.health.port);
    let health = Arc::new(HealthServer::new(
        health_port,
        router.clone(),
        keys.clone(),
        bus.clone(),
    ));
    tokio::spawn(async move {
        if let Err(e) = health.start().await {
            error!("health server error: {e}");
        }
    });

    // Agents.
    let workspace = PathBuf::from(&config.agents.workspace);
    let mut runtimes = Vec::new();
    let architect = AgentRuntime::new(
        Arc::new(ArchitectAgent::new(router.clone(), workspace.clone())),
        bus.clone(),
        runtime_config("architect-1", &config),
    );
    let coder = AgentRuntime::new(
        Arc::new(CoderAgent::new(router.clone(), workspace.clone())),
        bus.clone(),
        runtime_config("coder-1", &config),
    );
    let tester = AgentRuntime::new(
        Arc::new(TesterAgent::new(".")),
        bus.clone(),
        runtime_config("tester-1", &config),
    );
    let debugger = AgentRuntime::new(
        Arc::new(DebuggerAgent::new(router.clone())),
        bus.clone(),
        runtime_config("debugger-1", &config),
    );
    for runtime in [architect, coder, tester, debugger] {
        runtime.start().await?;
        runtimes.push(runtime);
    }

    // Orchestrator and loop driver.
    let store = Arc::new(InMemoryStateStore::new());
    let orchestrator = Arc::new(Orchestrator::new(bus.clone(), store.clone()).await?);
    let driver = IterativeLoop::new(
        orchestrator.clone(),
        store,
        IterativeLoopConfig {
            max_iterations: config.workflow.max_iterations,
        },
    );

    // Load and drive the TodoList.
    let raw = tokio::fs::read_to_string(&todolist_path).await?;
    let todo = TodoList::from_json(&raw)?;
    let workflow_id = orchestrator.load_workflow(todo).await?;

    let report = tokio::select! {
        report = driver.run_to_convergence(&workflow_id) => report?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            for runtime in &runtimes {
                runtime.shutdown().await;
            }
            return Ok(());
        }
    };

    tokio::fs::write(&report_path, serde_json::to_vec_pretty(&report)?).await?;
    info!(
        workflow_id = %workflow_id,
        report = %report_path.display(),
        passes = report.passes.len(),
        "iteration report written"
    );

    for runtime in &runtimes {
        runtime.shutdown().await;
    }
    Ok(())
}

fn runtime_config(agent_id: &str, config: &PlatformConfig) -> AgentRuntimeConfig {
    let mut runtime = AgentRuntimeConfig::new(agent_id);
    runtime.max_in_flight = config.agents.max_in_flight;
    runtime
}
