//! Built-in demo task type
//!
//! A small arithmetic task type used by the `demo` subcommand: each
//! step fans one squaring subtask out to every node and the results are
//! only logged. It doubles as a worked example of implementing the
//! three extension traits.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use taskgrid::dispatch::{CleanupRoutine, DispatcherExtension};
use taskgrid::scheduler::{SchedulerExtension, SubtaskExecutor};
use taskgrid::{ExtensionRegistry, Result, Subtask, Task};

/// Task type identifier for the demo
pub const DEMO_TASK_TYPE: &str = "demo";

/// Build the meta blob carrying the step count
pub fn demo_meta(steps: u64) -> serde_json::Value {
    json!({ "steps": steps })
}

fn steps_from_meta(task: &Task) -> u64 {
    task.meta.get("steps").and_then(|v| v.as_u64()).unwrap_or(1)
}

// ─────────────────────────────────────────────────────────────────
// Dispatcher Extension
// ─────────────────────────────────────────────────────────────────

struct DemoDispatcherExt;

#[async_trait]
impl DispatcherExtension for DemoDispatcherExt {
    async fn next_step_subtasks(
        &self,
        task: &Task,
        step: u64,
        nodes: &[String],
    ) -> Result<Vec<serde_json::Value>> {
        if step > steps_from_meta(task) {
            return Ok(Vec::new());
        }
        Ok((0..nodes.len() as u64)
            .map(|slot| json!({ "step": step, "slot": slot }))
            .collect())
    }
}

// ─────────────────────────────────────────────────────────────────
// Scheduler Extension & Executor
// ─────────────────────────────────────────────────────────────────

struct DemoSchedulerExt;

#[async_trait]
impl SchedulerExtension for DemoSchedulerExt {
    fn is_idempotent(&self, _subtask: &Subtask) -> bool {
        true
    }

    fn executor(&self, _task: &Task, _step: u64) -> Result<Box<dyn SubtaskExecutor>> {
        Ok(Box::new(DemoExecutor))
    }
}

struct DemoExecutor;

#[async_trait]
impl SubtaskExecutor for DemoExecutor {
    async fn run_subtask(&mut self, subtask: &Subtask) -> Result<()> {
        let step = subtask.payload.get("step").and_then(|v| v.as_u64()).unwrap_or(0);
        let slot = subtask.payload.get("slot").and_then(|v| v.as_u64()).unwrap_or(0);
        info!(
            subtask_id = subtask.id,
            step,
            slot,
            square = slot * slot,
            "Demo subtask computed"
        );
        Ok(())
    }

    async fn rollback(&mut self, subtask: &Subtask) -> Result<()> {
        info!(subtask_id = subtask.id, "Demo subtask rolled back");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Cleanup Routine
// ─────────────────────────────────────────────────────────────────

struct DemoCleanup;

#[async_trait]
impl CleanupRoutine for DemoCleanup {
    async fn clean_up(&self, task: &Task) -> Result<()> {
        info!(task_id = task.id, key = %task.key, state = %task.state, "Demo task cleaned up");
        Ok(())
    }
}

/// Register the demo task type on a registry
pub fn register(registry: &ExtensionRegistry) {
    registry.register_dispatcher(DEMO_TASK_TYPE, Arc::new(|_| Arc::new(DemoDispatcherExt)));
    registry.register_scheduler(DEMO_TASK_TYPE, Arc::new(|_| Arc::new(DemoSchedulerExt)));
    registry.register_cleanup(DEMO_TASK_TYPE, Arc::new(|| Arc::new(DemoCleanup)));
}
