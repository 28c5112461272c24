//! Subtask executor contract
//!
//! One implementation per task type performs the actual work of a
//! subtask and knows how to compensate for it during task revert.

use async_trait::async_trait;

use crate::error::Result;
use crate::proto::{Subtask, Task};

// ─────────────────────────────────────────────────────────────────
// SubtaskExecutor Trait
// ─────────────────────────────────────────────────────────────────

/// Per-task-type unit that executes and rolls back one subtask.
///
/// The scheduler drives the forward contract in order: `init`,
/// `run_subtask`, `on_finished`, `cleanup`. The dispatcher drives
/// `rollback` during task revert, newest work first.
#[async_trait]
pub trait SubtaskExecutor: Send + Sync {
    /// Scoped acquisition of executor-local resources. On failure the
    /// subtask is marked failed without attempting `run_subtask`.
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Perform the unit of work. Must be safe to re-invoke if the task
    /// type declares idempotency.
    async fn run_subtask(&mut self, subtask: &Subtask) -> Result<()>;

    /// Post-processing after a successful `run_subtask` (e.g., result
    /// persistence). Failure here is treated as subtask failure.
    async fn on_finished(&mut self, subtask: &Subtask) -> Result<()> {
        let _ = subtask;
        Ok(())
    }

    /// Scoped release of executor-local resources. Invoked regardless
    /// of `run_subtask` outcome.
    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Undo the effects of a previously successful `run_subtask` for
    /// the same subtask. Must be safe to call even if `run_subtask`
    /// never ran for that subtask (no-op in that case).
    async fn rollback(&mut self, subtask: &Subtask) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────
// SchedulerExtension Trait
// ─────────────────────────────────────────────────────────────────

/// Per-task-type behavior of the scheduler, produced by the registered
/// scheduler factory when a node starts participating in a task.
#[async_trait]
pub trait SchedulerExtension: Send + Sync {
    /// Whether a subtask of this type may safely be re-run without
    /// duplicating side effects. Queried before deciding whether a
    /// crash-then-resume can re-run a subtask in place versus requiring
    /// compensating rollback first, and before any in-place retry.
    fn is_idempotent(&self, subtask: &Subtask) -> bool;

    /// Produce the executor for one subtask of the given step
    fn executor(&self, task: &Task, step: u64) -> Result<Box<dyn SubtaskExecutor>>;
}
