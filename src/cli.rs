//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the taskgrid node binary.

use clap::{Parser, Subcommand};

/// taskgrid - Distributed task dispatch and execution framework
///
/// Runs a node that claims tasks from the task store, fans their steps
/// out across an executor pool and drives them to a terminal state.
#[derive(Parser, Debug)]
#[command(name = "taskgrid")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the node
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the node (starts the dispatch manager and executor agents)
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "TASKGRID_CONFIG")]
        config: Option<String>,
    },

    /// Run a built-in demo task through the full dispatch machinery
    Demo {
        /// Path to configuration file
        #[arg(short, long, env = "TASKGRID_CONFIG")]
        config: Option<String>,

        /// Number of steps in the demo task
        #[arg(long, default_value = "2")]
        steps: u64,

        /// Inject a failure to exercise the rollback path
        #[arg(long)]
        fail: bool,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
