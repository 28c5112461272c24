//! Error types for the taskgrid framework
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - Retryable/fatal classification driving the retry policy
//! - Error context and chaining
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::proto::{SubtaskState, TaskState};

/// Result type alias for framework operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // Store errors (2xx)
    StoreUnavailable = 200,
    TaskNotFound = 201,
    SubtaskNotFound = 202,
    DuplicateTaskKey = 203,
    StateConflict = 204,
    InvalidTransition = 205,

    // Registry errors (3xx)
    TypeNotRegistered = 300,

    // Dispatch errors (4xx)
    PlanningFailed = 400,
    NoEligibleNodes = 401,
    RollbackFailed = 402,
    CleanupFailed = 403,

    // Execution errors (5xx)
    ExecutionFailed = 500,
    ExecutionTimeout = 501,
    ExecutionCancelled = 502,
    ExecutorInitFailed = 503,
    RetriesExhausted = 504,

    // Internal errors (9xx)
    InternalError = 900,
    NotSupported = 902,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // Store errors
            300..=399 => 30, // Registry errors
            400..=499 => 40, // Dispatch errors
            500..=599 => 50, // Execution errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the framework
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    // ─────────────────────────────────────────────────────────────
    // Store Errors
    // ─────────────────────────────────────────────────────────────

    /// The task store could not serve the request
    #[error("Task store unavailable: {0}")]
    StoreUnavailable(String),

    /// Task not found by id or key
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Subtask not found
    #[error("Subtask not found: {0}")]
    SubtaskNotFound(i64),

    /// A task with the same key already exists
    #[error("Task key already exists: {0}")]
    DuplicateTaskKey(String),

    /// Conditional state switch rejected: prior state did not match
    #[error("State conflict on task {task_id}: expected {expected}, found {actual}")]
    StateConflict {
        task_id: i64,
        expected: TaskState,
        actual: TaskState,
    },

    /// Conditional subtask state switch rejected
    #[error("State conflict on subtask {subtask_id}: expected {expected}, found {actual}")]
    SubtaskStateConflict {
        subtask_id: i64,
        expected: SubtaskState,
        actual: SubtaskState,
    },

    /// Transition not permitted by the task state machine
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: i64,
        from: TaskState,
        to: TaskState,
    },

    // ─────────────────────────────────────────────────────────────
    // Registry Errors
    // ─────────────────────────────────────────────────────────────

    /// No extension binding registered for a task type
    #[error("Task type not registered: {0}")]
    TypeNotRegistered(String),

    // ─────────────────────────────────────────────────────────────
    // Dispatch Errors
    // ─────────────────────────────────────────────────────────────

    /// The dispatcher extension failed to plan a step
    #[error("Failed to plan step {step} of task {task_id}: {message}")]
    PlanningFailed {
        task_id: i64,
        step: u64,
        message: String,
    },

    /// No nodes eligible to run a task's subtasks
    #[error("No eligible nodes for task {0}")]
    NoEligibleNodes(i64),

    /// Rollback of a previously applied subtask failed
    #[error("Rollback failed for subtask {subtask_id}: {message}")]
    RollbackFailed { subtask_id: i64, message: String },

    /// Cleanup routine failed after terminal commit
    #[error("Cleanup failed for task {task_id}: {message}")]
    CleanupFailed { task_id: i64, message: String },

    // ─────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────

    /// Subtask execution failed
    #[error("Subtask execution failed: {message}")]
    ExecutionFailed {
        subtask_id: Option<i64>,
        message: String,
        retryable: bool,
    },

    /// Subtask execution timed out
    #[error("Subtask {subtask_id} timed out after {timeout_secs}s")]
    ExecutionTimeout { subtask_id: i64, timeout_secs: u64 },

    /// Execution was cancelled externally
    #[error("Execution cancelled: {0}")]
    ExecutionCancelled(String),

    /// Executor resource acquisition failed
    #[error("Executor init failed: {0}")]
    ExecutorInitFailed(String),

    /// Subtask retry budget exhausted
    #[error("Subtask {subtask_id} exhausted its retry budget ({attempts} attempts)")]
    RetriesExhausted { subtask_id: i64, attempts: u32 },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// Feature not supported
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,

            Error::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            Error::TaskNotFound(_) => ErrorCode::TaskNotFound,
            Error::SubtaskNotFound(_) => ErrorCode::SubtaskNotFound,
            Error::DuplicateTaskKey(_) => ErrorCode::DuplicateTaskKey,
            Error::StateConflict { .. } | Error::SubtaskStateConflict { .. } => {
                ErrorCode::StateConflict
            }
            Error::InvalidTransition { .. } => ErrorCode::InvalidTransition,

            Error::TypeNotRegistered(_) => ErrorCode::TypeNotRegistered,

            Error::PlanningFailed { .. } => ErrorCode::PlanningFailed,
            Error::NoEligibleNodes(_) => ErrorCode::NoEligibleNodes,
            Error::RollbackFailed { .. } => ErrorCode::RollbackFailed,
            Error::CleanupFailed { .. } => ErrorCode::CleanupFailed,

            Error::ExecutionFailed { .. } => ErrorCode::ExecutionFailed,
            Error::ExecutionTimeout { .. } => ErrorCode::ExecutionTimeout,
            Error::ExecutionCancelled(_) => ErrorCode::ExecutionCancelled,
            Error::ExecutorInitFailed(_) => ErrorCode::ExecutorInitFailed,
            Error::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,

            Error::Io(_) => ErrorCode::InternalError,
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::NotSupported(_) => ErrorCode::NotSupported,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is transient and worth retrying.
    ///
    /// Store unavailability and CAS conflicts resolve on a later poll;
    /// execution timeouts may be retried when the task type is idempotent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::StoreUnavailable(_)
            | Error::StateConflict { .. }
            | Error::SubtaskStateConflict { .. }
            | Error::ExecutionTimeout { .. }
            | Error::Io(_) => true,
            Error::ExecutionFailed { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Check if the error is fatal (the node should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'taskgrid config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'taskgrid config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values. See documentation for valid options."
            ),
            Error::TypeNotRegistered(_) => Some(
                "Register dispatcher, scheduler and cleanup factories for the task type before submitting tasks of that type."
            ),
            Error::DuplicateTaskKey(_) => Some(
                "Task keys are unique. Pick a new key or query the existing task with 'task_by_key'."
            ),
            Error::StoreUnavailable(_) => Some(
                "The task store is temporarily unreachable. Control loops back off and retry automatically."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!("\x1b[31mError [{}]\x1b[0m: {}\n", code.as_str(), self);

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        let code = self.code();
        format!("[{}] {}", code.as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a config parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a terminal (non-retryable) execution failure
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Error::ExecutionFailed {
            subtask_id: None,
            message: message.into(),
            retryable: false,
        }
    }

    /// Create a transient (retryable) execution failure
    pub fn execution_failed_transient(message: impl Into<String>) -> Self {
        Error::ExecutionFailed {
            subtask_id: None,
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a planning failure
    pub fn planning_failed(task_id: i64, step: u64, message: impl Into<String>) -> Self {
        Error::PlanningFailed {
            task_id,
            step,
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::StoreUnavailable.as_str(), "E200");
        assert_eq!(ErrorCode::ExecutionFailed.as_str(), "E500");
        assert_eq!(ErrorCode::InternalError.as_str(), "E900");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(ErrorCode::ConfigNotFound.exit_code(), 10);
        assert_eq!(ErrorCode::TaskNotFound.exit_code(), 20);
        assert_eq!(ErrorCode::TypeNotRegistered.exit_code(), 30);
        assert_eq!(ErrorCode::ExecutionFailed.exit_code(), 50);
        assert_eq!(ErrorCode::InternalError.exit_code(), 90);
    }

    #[test]
    fn test_error_codes() {
        let err = Error::config_not_found("/test");
        assert_eq!(err.code(), ErrorCode::ConfigNotFound);

        let err = Error::DuplicateTaskKey("key1".into());
        assert_eq!(err.code(), ErrorCode::DuplicateTaskKey);

        let err = Error::TypeNotRegistered("example".into());
        assert_eq!(err.code(), ErrorCode::TypeNotRegistered);
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::StoreUnavailable("down".into()).is_retryable());
        assert!(Error::execution_failed_transient("flaky").is_retryable());
        assert!(!Error::execution_failed("broken").is_retryable());
        assert!(!Error::config_not_found("/test").is_retryable());
        assert!(!Error::TypeNotRegistered("example".into()).is_retryable());
    }

    #[test]
    fn test_error_fatal() {
        assert!(Error::config_not_found("/test").is_fatal());
        assert!(Error::config_validation("bad").is_fatal());
        assert!(!Error::StoreUnavailable("down".into()).is_fatal());
        assert!(!Error::execution_failed("broken").is_fatal());
    }

    #[test]
    fn test_error_suggestions() {
        let err = Error::config_not_found("/test");
        assert!(err.suggestion().is_some());
        assert!(err.suggestion().unwrap().contains("config init"));

        let err = Error::TypeNotRegistered("example".into());
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn test_format_for_terminal() {
        let err = Error::config_not_found("/test/config.toml");
        let formatted = err.format_for_terminal();

        // Should contain error code
        assert!(formatted.contains("E100"));
        // Should contain ANSI color codes
        assert!(formatted.contains("\x1b[31m"));
        // Should contain hint
        assert!(formatted.contains("Hint"));
    }

    #[test]
    fn test_format_for_log() {
        let err = Error::DuplicateTaskKey("key1".into());
        let formatted = err.format_for_log();

        assert!(formatted.contains("[E203]"));
        assert!(!formatted.contains("\x1b["));
    }

    #[test]
    fn test_state_conflict_display() {
        let err = Error::StateConflict {
            task_id: 7,
            expected: TaskState::Running,
            actual: TaskState::Reverting,
        };
        let msg = err.to_string();
        assert!(msg.contains("task 7"));
        assert!(msg.contains("running"));
        assert!(msg.contains("reverting"));
    }
}
