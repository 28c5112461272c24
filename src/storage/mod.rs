//! Task store: the single source of truth
//!
//! All coordination between dispatcher and scheduler instances happens
//! through conditional state transitions against the store (optimistic
//! concurrency): a transition is only accepted if the prior state matches
//! expectation. Nothing in the framework shares mutable state across node
//! boundaries any other way.
//!
//! The storage engine itself is an external collaborator; [`MemTaskStore`]
//! is the in-process reference implementation used by the node binary and
//! the test harness.

mod mem;

pub use mem::MemTaskStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::proto::{NewSubtask, Subtask, SubtaskState, Task, TaskState};

/// Durable record of tasks, subtasks and their states.
///
/// Conditional update operations return `Ok(false)` when the expected
/// prior state did not match; callers treat that as "someone else moved
/// first" and re-observe. `Ok(true)` means the transition was committed.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────
    // Task operations
    // ─────────────────────────────────────────────────────────────

    /// Create a new task in `Pending` state. The key must be unique
    /// across live and historical tasks.
    async fn create_task(
        &self,
        key: &str,
        task_type: &str,
        concurrency: u32,
        meta: serde_json::Value,
    ) -> Result<i64>;

    /// Fetch a live (non-terminal) task by id
    async fn task_by_id(&self, task_id: i64) -> Result<Option<Task>>;

    /// Fetch a live (non-terminal) task by key
    async fn task_by_key(&self, key: &str) -> Result<Option<Task>>;

    /// Fetch a task by key, including terminal tasks retained in history
    async fn task_history_by_key(&self, key: &str) -> Result<Option<Task>>;

    /// List live tasks currently in any of the given states
    async fn tasks_in_states(&self, states: &[TaskState]) -> Result<Vec<Task>>;

    /// Conditionally switch a task's state. Rejects transitions the
    /// task state machine does not permit.
    async fn switch_task_state(&self, task_id: i64, from: TaskState, to: TaskState)
        -> Result<bool>;

    /// Conditionally commit a terminal state and retire the task to
    /// history. The record becomes immutable.
    async fn finish_task(
        &self,
        task_id: i64,
        from: TaskState,
        to: TaskState,
        error: Option<String>,
    ) -> Result<bool>;

    /// Advance the task's current step marker
    async fn set_task_step(&self, task_id: i64, step: u64) -> Result<()>;

    /// Record an external cancellation request on a live task. The
    /// dispatcher loop observes the flag and drives the state change.
    async fn request_cancel(&self, task_id: i64) -> Result<bool>;

    /// Record an external pause request on a live task
    async fn request_pause(&self, task_id: i64) -> Result<bool>;

    /// Conditionally switch `Paused -> Running` and clear the pause
    /// flag, making the task claimable again
    async fn resume_task(&self, task_id: i64) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────
    // Subtask operations
    // ─────────────────────────────────────────────────────────────

    /// Persist a batch of subtasks for one step, in `Pending` state.
    /// Returns the assigned ids in creation order.
    async fn create_subtasks(&self, subtasks: Vec<NewSubtask>) -> Result<Vec<i64>>;

    /// All subtasks of one (task, step), in creation order
    async fn subtasks_for_step(&self, task_id: i64, step: u64) -> Result<Vec<Subtask>>;

    /// Pending subtasks of a task assigned to the given node
    async fn claimable_subtasks(&self, task_id: i64, node: &str) -> Result<Vec<Subtask>>;

    /// Conditionally switch a subtask's state, recording an error on
    /// the failure path
    async fn switch_subtask_state(
        &self,
        subtask_id: i64,
        from: SubtaskState,
        to: SubtaskState,
        error: Option<String>,
    ) -> Result<bool>;

    /// Bump a subtask's attempt counter; returns the new count
    async fn record_subtask_attempt(&self, subtask_id: i64) -> Result<u32>;
}
