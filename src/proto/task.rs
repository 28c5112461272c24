//! Task record and task state machine
//!
//! A task is a client-submitted unit of work with an ordered sequence of
//! steps. Step N+1 subtasks are never created until every step N subtask
//! has reached a terminal subtask state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────
// Task State
// ─────────────────────────────────────────────────────────────────

/// Lifecycle states of a task.
///
/// ```text
/// Pending -> Running -> Succeed
///                    -> Reverting  -> Reverted
///                    -> Cancelling -> Reverted
///                    -> Pausing    -> Paused -> Running (explicit resume)
/// ```
///
/// `Succeed` and `Reverted` are terminal. `Paused` is terminal-for-now:
/// it holds until an explicit resume, and is never entered or left
/// implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, not yet claimed by a dispatcher
    Pending,
    /// Claimed; steps are being executed
    Running,
    /// All steps completed successfully (terminal)
    Succeed,
    /// External cancellation observed; rollback in progress
    Cancelling,
    /// A subtask failed terminally; rollback in progress
    Reverting,
    /// Rollback finished (terminal)
    Reverted,
    /// External pause observed; draining in-flight subtasks
    Pausing,
    /// Drained and parked; waiting for explicit resume
    Paused,
}

impl TaskState {
    /// All task states
    pub fn all() -> &'static [TaskState] {
        &[
            TaskState::Pending,
            TaskState::Running,
            TaskState::Succeed,
            TaskState::Cancelling,
            TaskState::Reverting,
            TaskState::Reverted,
            TaskState::Pausing,
            TaskState::Paused,
        ]
    }

    /// Whether the state admits no further transitions.
    ///
    /// `Paused` counts as terminal here because only the explicit
    /// `resume_task` store operation may leave it; the dispatcher loop
    /// exits on reaching it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeed | TaskState::Reverted | TaskState::Paused)
    }

    /// Whether the task is still making forward or compensating progress
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskState::Pending
                | TaskState::Running
                | TaskState::Cancelling
                | TaskState::Reverting
                | TaskState::Pausing
        )
    }

    /// Check a transition against the state machine
    pub fn can_transition_to(&self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (*self, to),
            (Pending, Running)
                | (Running, Succeed)
                | (Running, Reverting)
                | (Running, Cancelling)
                | (Running, Pausing)
                | (Reverting, Reverted)
                | (Cancelling, Reverted)
                | (Pausing, Paused)
                | (Paused, Running)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeed => write!(f, "succeed"),
            TaskState::Cancelling => write!(f, "cancelling"),
            TaskState::Reverting => write!(f, "reverting"),
            TaskState::Reverted => write!(f, "reverted"),
            TaskState::Pausing => write!(f, "pausing"),
            TaskState::Paused => write!(f, "paused"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Record
// ─────────────────────────────────────────────────────────────────

/// A task as stored in the task store.
///
/// Mutated only through the store's state-transition operations, all of
/// which are conditional on the expected prior state. Immutable once in
/// a terminal state; retained in history for later query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Numeric ID assigned by the store on creation
    pub id: i64,

    /// Unique, client-chosen key
    pub key: String,

    /// Identifies which registered extension binding governs this task
    pub task_type: String,

    /// Current lifecycle state
    pub state: TaskState,

    /// Current step, 1-based; 0 until the first step is planned
    pub step: u64,

    /// Max parallel subtasks per node
    pub concurrency: u32,

    /// Opaque type-specific metadata
    #[serde(default)]
    pub meta: serde_json::Value,

    /// Error recorded on the failure path, surfaced via history
    #[serde(default)]
    pub error: Option<String>,

    /// External cancellation requested; observed by the dispatcher loop
    #[serde(default)]
    pub cancel_requested: bool,

    /// External pause requested; observed by the dispatcher loop
    #[serde(default)]
    pub pause_requested: bool,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether the task has reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
