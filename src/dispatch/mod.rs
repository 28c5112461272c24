//! Task dispatch
//!
//! A [`Dispatcher`] owns one task end-to-end: step sequencing, subtask
//! fan-out, progress aggregation, failure detection and the terminal
//! decision. The [`DispatchManager`] picks up eligible tasks and spawns
//! one dispatcher per task.

#[allow(clippy::module_inception)]
mod dispatcher;
mod manager;

pub use dispatcher::{Dispatcher, DispatchConfig};
pub use manager::DispatchManager;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::proto::Task;

// ─────────────────────────────────────────────────────────────────
// DispatcherExtension Trait
// ─────────────────────────────────────────────────────────────────

/// Per-task-type planning behavior of the dispatcher, produced by the
/// registered dispatcher factory when a task is claimed.
#[async_trait]
pub trait DispatcherExtension: Send + Sync {
    /// Produce the subtask payloads for `step` (1-based). An empty
    /// result means the previous step was the last one and the task is
    /// complete.
    async fn next_step_subtasks(
        &self,
        task: &Task,
        step: u64,
        nodes: &[String],
    ) -> Result<Vec<serde_json::Value>>;

    /// Restrict which nodes may run this task's subtasks. Defaults to
    /// every node in the pool.
    fn eligible_nodes(&self, task: &Task, all_nodes: &[String]) -> Vec<String> {
        let _ = task;
        all_nodes.to_vec()
    }

    /// Whether a planning error is worth retrying on a later tick
    fn is_retryable_error(&self, error: &Error) -> bool {
        error.is_retryable()
    }
}

// ─────────────────────────────────────────────────────────────────
// CleanupRoutine Trait
// ─────────────────────────────────────────────────────────────────

/// Per-task-type hook invoked once after a task reaches `Succeed` or
/// `Reverted`, regardless of path.
///
/// Must be side-effect-idempotent: a crash between terminal commit and
/// cleanup invocation may cause the framework to retry it on recovery.
#[async_trait]
pub trait CleanupRoutine: Send + Sync {
    async fn clean_up(&self, task: &Task) -> Result<()>;
}
