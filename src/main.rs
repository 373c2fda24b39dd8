use agent_runtime::agent::AgentEngine;
use agent_runtime::breaker::BreakerRegistry;
use agent_runtime::config::{load_providers, FileConfigStore, RuntimeSettings};
use agent_runtime::gateway::ToolGateway;
use agent_runtime::health::{HealthMonitor, HealthState};
use agent_runtime::model::ModelClient;
use agent_runtime::server::{self, AppState};
use agent_runtime::tools::{BuiltinRegistry, ClockTool, StatusTool};
use clap::Parser;
use log::{info, warn, LevelFilter};
use simplelog::{ColorChoice, Config as LogConfig, TermLogger, TerminalMode};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "agent-runtime")]
#[command(author, version, about = "Agent orchestration service with an OpenAI-compatible surface", long_about = None)]
struct Cli {
    /// Address to bind the HTTP surface on
    #[arg(long, default_value = "127.0.0.1:8900")]
    bind: String,

    /// Path to the tool-provider configuration file
    #[arg(long, default_value = "providers.json")]
    providers: PathBuf,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    TermLogger::init(level, LogConfig::default(), TerminalMode::Mixed, ColorChoice::Auto)?;

    let settings = Arc::new(RuntimeSettings::from_env());

    let providers = if cli.providers.exists() {
        load_providers(&cli.providers)?
    } else {
        warn!(
            "provider file {} not found, starting with builtins only",
            cli.providers.display()
        );
        HashMap::new()
    };

    let core_targets: HashSet<String> = providers
        .values()
        .filter(|p| p.core)
        .map(|p| p.name.clone())
        .collect();
    info!(
        "loaded {} providers ({} core) from {}",
        providers.len(),
        core_targets.len(),
        cli.providers.display()
    );

    let store = Arc::new(FileConfigStore::new(&cli.providers));
    let breakers = Arc::new(BreakerRegistry::new(core_targets, Some(store)));
    let health = Arc::new(HealthState::new());
    let client = reqwest::Client::builder().timeout(settings.http_timeout).build()?;

    let builtins = Arc::new(
        BuiltinRegistry::new()
            .register(ClockTool)
            .register(StatusTool::new(health.clone(), breakers.clone())),
    );

    let gateway = Arc::new(ToolGateway::new(
        providers,
        client.clone(),
        settings.http_timeout,
        breakers.clone(),
        health.clone(),
        builtins,
    ));
    gateway.discover().await;
    info!("tool menu:\n{}", gateway.menu_summary());

    let backend = Arc::new(ModelClient::new(
        client,
        settings.clone(),
        breakers.clone(),
        health.clone(),
    ));
    let engine = Arc::new(AgentEngine::new(backend, gateway.clone(), settings.clone()));

    let monitor = Arc::new(HealthMonitor::new(
        gateway.clone(),
        breakers.clone(),
        health.clone(),
        settings.clone(),
    ));
    let monitor_task = monitor.spawn();

    let state = Arc::new(AppState {
        engine,
        settings,
        health,
        breakers,
    });

    let listener = tokio::net::TcpListener::bind(&cli.bind).await?;
    info!("listening on {}", cli.bind);
    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutting down");
    monitor_task.abort();
    gateway.shutdown_stdio_children().await;
    Ok(())
}
