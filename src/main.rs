//! taskgrid - Distributed task dispatch and execution framework
//!
//! This is the main entry point for the taskgrid node binary. A node
//! runs the dispatch manager and a pool of executor agents over a task
//! store, claims submitted tasks and drives them to a terminal state.

mod demo;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use taskgrid::cli::{Cli, Commands, ConfigSubcommand};
use taskgrid::config::{self, NodeConfig};
use taskgrid::faultinject::{FaultHooks, EXECUTOR_RUN_ERR};
use taskgrid::storage::MemTaskStore;
use taskgrid::{logging, version, Error, ExtensionRegistry, Result, Runtime};

fn main() {
    if let Err(e) = run() {
        eprintln!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn run() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            version::print_version();
            Ok(())
        }
        Commands::Config { subcommand } => {
            // Config commands use minimal logging
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand)
        }
        Commands::Run { ref config } => {
            let config = NodeConfig::load(config.as_deref())?;
            let _guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;
            build_tokio_runtime()?.block_on(run_node(config))
        }
        Commands::Demo {
            ref config,
            steps,
            fail,
        } => {
            let config = NodeConfig::load(config.as_deref())?;
            let _guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;
            build_tokio_runtime()?.block_on(run_demo(config, steps, fail))
        }
    }
}

fn build_tokio_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create runtime: {}", e)))
}

// ─────────────────────────────────────────────────────────────────
// Config Command
// ─────────────────────────────────────────────────────────────────

fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let config = NodeConfig::load(config.as_deref())?;
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| Error::Internal(format!("Failed to render config: {}", e)))?;
            println!("{rendered}");
            Ok(())
        }
        ConfigSubcommand::Init { path, force } => config::init_config(path.as_deref(), force),
        ConfigSubcommand::Validate { config } => {
            NodeConfig::load(config.as_deref())?;
            println!("Configuration is valid");
            Ok(())
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Run Command
// ─────────────────────────────────────────────────────────────────

/// Run a node until interrupted
async fn run_node(config: NodeConfig) -> Result<()> {
    let registry = Arc::new(ExtensionRegistry::new());
    demo::register(&registry);

    let runtime = Runtime::new(
        Arc::new(MemTaskStore::new()),
        registry,
        config.to_runtime_config(),
    );
    runtime.start();

    info!(nodes = runtime.nodes().len(), "Node running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("Failed to listen for shutdown signal: {}", e)))?;

    info!("Shutdown signal received");
    runtime.shutdown().await;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Demo Command
// ─────────────────────────────────────────────────────────────────

/// Submit one demo task and report its terminal state
async fn run_demo(config: NodeConfig, steps: u64, fail: bool) -> Result<()> {
    let registry = Arc::new(ExtensionRegistry::new());
    demo::register(&registry);

    let hooks = Arc::new(FaultHooks::new());
    let runtime = Runtime::new(
        Arc::new(MemTaskStore::new()),
        registry,
        config.to_runtime_config(),
    )
    .with_fault_hooks(hooks.clone());
    runtime.start();

    let key = "demo-task";
    if fail {
        hooks.arm(EXECUTOR_RUN_ERR, Some(key), 1);
        info!("Armed a one-shot execution failure");
    }

    runtime
        .submit_task(key, demo::DEMO_TASK_TYPE, 2, demo::demo_meta(steps))
        .await?;

    let task = runtime.wait_task_exit(key, Duration::from_secs(60)).await?;
    runtime.shutdown().await;

    println!("Demo task finished: state={}", task.state);
    if let Some(error) = task.error {
        println!("Recorded error: {}", error);
    }
    Ok(())
}
