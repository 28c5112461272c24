//! Configuration system for taskgrid nodes
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (TASKGRID_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dispatch::DispatchConfig;
use crate::error::{Error, Result};
use crate::runtime::{default_nodes, RuntimeConfig};
use crate::scheduler::SchedulerConfig;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identity and executor pool
    pub node: NodeSettings,

    /// Dispatcher loop settings
    pub dispatch: DispatchSettings,

    /// Scheduler loop settings
    pub scheduler: SchedulerSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Node identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Human-readable node name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Explicit executor node ids. When empty, a pool of `pool_size`
    /// ids is generated from the host name.
    #[serde(default)]
    pub executors: Vec<String>,

    /// Generated executor pool size (0 = derive from CPU count)
    pub pool_size: u32,
}

/// Dispatcher loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Store poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Upper bound for store-unavailability backoff in milliseconds
    pub max_backoff_ms: u64,
}

/// Scheduler loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Store poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// In-place retry budget per subtask (idempotent task types only)
    pub subtask_retry_budget: u32,

    /// Upper bound for store-unavailability backoff in milliseconds
    pub max_backoff_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (None = console only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings::default(),
            dispatch: DispatchSettings::default(),
            scheduler: SchedulerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: None,
            executors: vec![],
            pool_size: 0, // Auto-detect
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            max_backoff_ms: 5000,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            subtask_retry_budget: 3,
            max_backoff_ms: 5000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl NodeConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::ConfigNotFound {
                path: path.clone(),
                source: Some(e),
            })?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let expanded = shellexpand::tilde(path);
            let path = PathBuf::from(expanded.as_ref());
            if path.exists() {
                return Ok(Some(path));
            } else {
                return Err(Error::config_not_found(path));
            }
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            PathBuf::from("taskgrid.toml"),
            PathBuf::from("config.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("taskgrid").join("taskgrid.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".taskgrid").join("config.toml"))
                .unwrap_or_default(),
            // System config (Linux)
            PathBuf::from("/etc/taskgrid/taskgrid.toml"),
        ];

        for path in &search_paths {
            if path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Node settings
        if let Ok(val) = std::env::var("TASKGRID_NODE_NAME") {
            self.node.name = Some(val);
        }
        if let Ok(val) = std::env::var("TASKGRID_EXECUTORS") {
            self.node.executors = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(val) = std::env::var("TASKGRID_POOL_SIZE") {
            if let Ok(n) = val.parse() {
                self.node.pool_size = n;
            }
        }

        // Dispatch settings
        if let Ok(val) = std::env::var("TASKGRID_DISPATCH_POLL_MS") {
            if let Ok(n) = val.parse() {
                self.dispatch.poll_interval_ms = n;
            }
        }
        if let Ok(val) = std::env::var("TASKGRID_DISPATCH_MAX_BACKOFF_MS") {
            if let Ok(n) = val.parse() {
                self.dispatch.max_backoff_ms = n;
            }
        }

        // Scheduler settings
        if let Ok(val) = std::env::var("TASKGRID_SCHEDULER_POLL_MS") {
            if let Ok(n) = val.parse() {
                self.scheduler.poll_interval_ms = n;
            }
        }
        if let Ok(val) = std::env::var("TASKGRID_RETRY_BUDGET") {
            if let Ok(n) = val.parse() {
                self.scheduler.subtask_retry_budget = n;
            }
        }
        if let Ok(val) = std::env::var("TASKGRID_SCHEDULER_MAX_BACKOFF_MS") {
            if let Ok(n) = val.parse() {
                self.scheduler.max_backoff_ms = n;
            }
        }

        // Logging settings
        if let Ok(val) = std::env::var("TASKGRID_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("TASKGRID_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("TASKGRID_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.poll_interval_ms == 0 {
            return Err(Error::config_field_invalid(
                "dispatch.poll_interval_ms",
                "poll interval must be greater than zero",
            ));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(Error::config_field_invalid(
                "scheduler.poll_interval_ms",
                "poll interval must be greater than zero",
            ));
        }
        if self.node.pool_size > 256 {
            return Err(Error::config_field_invalid(
                "node.pool_size",
                "executor pool size must be at most 256",
            ));
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Build the runtime configuration from these settings
    pub fn to_runtime_config(&self) -> RuntimeConfig {
        let nodes = if !self.node.executors.is_empty() {
            self.node.executors.clone()
        } else if self.node.pool_size > 0 {
            default_nodes(self.node.pool_size as usize)
        } else {
            Vec::new() // Runtime derives from CPU count
        };

        RuntimeConfig {
            nodes,
            dispatch: DispatchConfig {
                poll_interval: Duration::from_millis(self.dispatch.poll_interval_ms),
                max_backoff: Duration::from_millis(self.dispatch.max_backoff_ms),
            },
            scheduler: SchedulerConfig {
                poll_interval: Duration::from_millis(self.scheduler.poll_interval_ms),
                subtask_retry_budget: self.scheduler.subtask_retry_budget,
                max_backoff: Duration::from_millis(self.scheduler.max_backoff_ms),
            },
        }
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<()> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".taskgrid")
                .join("config.toml")
        });

    // Check if file exists
    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    // Create parent directories
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Generate default config with comments
    let config_content = generate_default_config();

    // Write the file
    fs::write(&config_path, config_content)?;

    println!("Configuration file created: {}", config_path.display());
    Ok(())
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# taskgrid node configuration
# https://github.com/taskgrid/taskgrid

[node]
# Human-readable node name
# name = "my-node"

# Explicit executor node ids. Leave empty to generate a pool from the
# host name.
executors = []

# Generated executor pool size (0 = derive from CPU count)
pool_size = 0

[dispatch]
# Dispatcher store poll interval in milliseconds
poll_interval_ms = 100

# Upper bound for store-unavailability backoff in milliseconds
max_backoff_ms = 5000

[scheduler]
# Scheduler store poll interval in milliseconds
poll_interval_ms = 100

# In-place retry budget per subtask (idempotent task types only)
subtask_retry_budget = 3

# Upper bound for store-unavailability backoff in milliseconds
max_backoff_ms = 5000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.taskgrid/logs/taskgrid.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
