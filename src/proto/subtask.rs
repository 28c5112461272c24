//! Subtask record and subtask state machine
//!
//! A subtask is the unit of work assigned to one node within one step.
//! Its states are a reduced mirror of the task state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────
// Subtask State
// ─────────────────────────────────────────────────────────────────

/// Lifecycle states of a subtask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskState {
    /// Persisted, waiting to be claimed by its node's scheduler
    Pending,
    /// Claimed and executing
    Running,
    /// Execution and post-processing finished successfully (terminal)
    Succeeded,
    /// Execution failed terminally (terminal)
    Failed,
    /// Never ran, or was compensated during revert (terminal)
    Cancelled,
}

impl SubtaskState {
    /// Whether the state admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubtaskState::Succeeded | SubtaskState::Failed | SubtaskState::Cancelled
        )
    }
}

impl std::fmt::Display for SubtaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubtaskState::Pending => write!(f, "pending"),
            SubtaskState::Running => write!(f, "running"),
            SubtaskState::Succeeded => write!(f, "succeeded"),
            SubtaskState::Failed => write!(f, "failed"),
            SubtaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Subtask Record
// ─────────────────────────────────────────────────────────────────

/// A subtask as stored in the task store.
///
/// Belongs to exactly one task. Subtasks of the same step form a set
/// with no ordering invariant among them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Numeric ID assigned by the store on creation
    pub id: i64,

    /// Owning task
    pub task_id: i64,

    /// Step this subtask belongs to (1-based)
    pub step: u64,

    /// Node assigned to execute this subtask
    pub node: String,

    /// Current lifecycle state
    pub state: SubtaskState,

    /// Opaque payload produced by the dispatcher extension
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Executions attempted so far (in-place retries)
    #[serde(default)]
    pub attempts: u32,

    /// Error recorded on the failure path
    #[serde(default)]
    pub error: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

/// Specification of a subtask to be created by the dispatcher when it
/// persists a step's fan-out.
#[derive(Debug, Clone)]
pub struct NewSubtask {
    pub task_id: i64,
    pub step: u64,
    pub node: String,
    pub payload: serde_json::Value,
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
