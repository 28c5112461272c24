//! Per-task dispatcher control loop
//!
//! Drives one task through its state machine:
//!
//! ```text
//! Pending -> Running -> Succeed
//!                    -> Reverting  -> Reverted
//!                    -> Cancelling -> Reverted
//!                    -> Pausing    -> Paused
//! ```
//!
//! Organic failure and external cancellation share a single rollback
//! routine; the only difference is which intermediate state the task
//! passes through.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::poll::StoreBackoff;
use crate::proto::{NewSubtask, SubtaskState, Task, TaskState};
use crate::registry::ExtensionRegistry;
use crate::storage::TaskStore;

// ─────────────────────────────────────────────────────────────────
// Dispatch Configuration
// ─────────────────────────────────────────────────────────────────

/// Tuning knobs for the dispatcher loops
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Interval between store polls
    pub poll_interval: Duration,

    /// Upper bound for the store-unavailability backoff
    pub max_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────

/// Owns the lifecycle of one task end-to-end
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    registry: Arc<ExtensionRegistry>,
    config: DispatchConfig,
    nodes: Vec<String>,
    task_id: i64,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Create a dispatcher for one task
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<ExtensionRegistry>,
        config: DispatchConfig,
        nodes: Vec<String>,
        task_id: i64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            nodes,
            task_id,
            shutdown,
        }
    }

    /// Run the control loop to a terminal state
    pub async fn run(self) {
        if let Err(e) = self.run_inner().await {
            error!(task_id = self.task_id, error = %e, "Dispatcher loop aborted");
        }
    }

    async fn run_inner(&self) -> Result<()> {
        let mut backoff = StoreBackoff::new(self.config.max_backoff);

        // Claim or resume. A rejected claim means another dispatcher
        // owns the task.
        let task = loop {
            match self.claim().await {
                Ok(Some(task)) => break task,
                Ok(None) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(task_id = self.task_id, error = %e, "Claim failed, backing off");
                    backoff.sleep().await;
                }
                Err(e) => {
                    self.escalate(&e).await?;
                    return Ok(());
                }
            }
        };
        backoff.reset();

        info!(
            task_id = task.id,
            key = %task.key,
            task_type = %task.task_type,
            step = task.step,
            "Dispatching task"
        );

        loop {
            if *self.shutdown.borrow() {
                // The task stays claimable; a later process picks it up.
                return Ok(());
            }

            let task = match self.store.task_by_id(self.task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(task_id = self.task_id, error = %e, "Store poll failed, backing off");
                    backoff.sleep().await;
                    continue;
                }
            };
            backoff.reset();

            if task.state != TaskState::Running {
                // Someone else finished or parked it.
                return Ok(());
            }

            // External cancellation: same rollback path as failure.
            if task.cancel_requested {
                info!(task_id = task.id, "Cancellation observed");
                if self
                    .store
                    .switch_task_state(task.id, TaskState::Running, TaskState::Cancelling)
                    .await?
                {
                    self.revert(&task, TaskState::Cancelling, Some("cancelled".to_string()))
                        .await?;
                }
                return Ok(());
            }

            // External pause: drain in-flight work, then park.
            if task.pause_requested {
                info!(task_id = task.id, "Pause observed");
                if self
                    .store
                    .switch_task_state(task.id, TaskState::Running, TaskState::Pausing)
                    .await?
                {
                    self.pause(&task).await?;
                }
                return Ok(());
            }

            match self.advance(&task).await {
                Ok(Progress::Terminal) => return Ok(()),
                Ok(Progress::Waiting) => {}
                Err(e) if e.is_retryable() => {
                    warn!(task_id = task.id, error = %e, "Dispatch tick failed, backing off");
                    backoff.sleep().await;
                    continue;
                }
                Err(e) => {
                    self.escalate(&e).await?;
                    return Ok(());
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Claim & Resume
    // ─────────────────────────────────────────────────────────────

    /// Claim a pending task, or adopt a running one (resume after pause
    /// or crash). Returns `None` when there is nothing to own.
    async fn claim(&self) -> Result<Option<Task>> {
        let task = match self.store.task_by_id(self.task_id).await? {
            Some(task) => task,
            None => return Ok(None),
        };

        match task.state {
            TaskState::Pending => {
                if !self
                    .store
                    .switch_task_state(task.id, TaskState::Pending, TaskState::Running)
                    .await?
                {
                    return Ok(None);
                }
                let mut task = task;
                task.state = TaskState::Running;
                self.plan_step(&task, 1).await?;
                Ok(Some(task))
            }
            TaskState::Running => {
                // Adoption path: reconcile subtasks left mid-flight by a
                // previous owner before continuing.
                self.reconcile_inflight(&task).await?;
                Ok(Some(task))
            }
            TaskState::Cancelling | TaskState::Reverting => {
                // A previous owner died mid-revert; finish the job. The
                // rollback routine skips already-compensated subtasks,
                // so resuming it is safe.
                self.revert(&task, task.state, task.error.clone()).await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Convert a non-retryable dispatch error into the revert path
    async fn escalate(&self, error: &Error) -> Result<()> {
        error!(task_id = self.task_id, error = %error, "Dispatch failed, reverting task");
        let task = match self.store.task_by_id(self.task_id).await? {
            Some(task) => task,
            None => return Ok(()),
        };
        if self
            .store
            .switch_task_state(task.id, TaskState::Running, TaskState::Reverting)
            .await?
        {
            self.revert(&task, TaskState::Reverting, Some(error.format_for_log()))
                .await?;
        }
        Ok(())
    }

    /// Re-run or fail subtasks stuck in `Running` from a previous
    /// incarnation, honoring the type's idempotency declaration.
    async fn reconcile_inflight(&self, task: &Task) -> Result<()> {
        if task.step == 0 {
            // Claimed but never planned; plan the first step now.
            self.plan_step(task, 1).await?;
            return Ok(());
        }

        let ext = self.registry.scheduler_ext(task)?;
        for subtask in self.store.subtasks_for_step(task.id, task.step).await? {
            if subtask.state != SubtaskState::Running {
                continue;
            }
            if ext.is_idempotent(&subtask) {
                info!(
                    task_id = task.id,
                    subtask_id = subtask.id,
                    "Re-running in-flight subtask (idempotent type)"
                );
                self.store
                    .switch_subtask_state(
                        subtask.id,
                        SubtaskState::Running,
                        SubtaskState::Pending,
                        None,
                    )
                    .await?;
            } else {
                // At-least-once risk surfaced: the safe outcome for a
                // non-idempotent type is compensating rollback.
                warn!(
                    task_id = task.id,
                    subtask_id = subtask.id,
                    "In-flight subtask of non-idempotent type, escalating to revert"
                );
                self.store
                    .switch_subtask_state(
                        subtask.id,
                        SubtaskState::Running,
                        SubtaskState::Failed,
                        Some("interrupted mid-execution; type is not idempotent".to_string()),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Forward Progress
    // ─────────────────────────────────────────────────────────────

    /// Inspect the current step and either wait, advance or finalize
    async fn advance(&self, task: &Task) -> Result<Progress> {
        let subtasks = self.store.subtasks_for_step(task.id, task.step).await?;

        // A subtask failed terminally, or was cancelled outside the
        // revert path: escalate the whole task.
        let broken = subtasks
            .iter()
            .any(|s| matches!(s.state, SubtaskState::Failed | SubtaskState::Cancelled));
        if broken {
            if self
                .store
                .switch_task_state(task.id, TaskState::Running, TaskState::Reverting)
                .await?
            {
                let reason = subtasks
                    .iter()
                    .find_map(|s| s.error.clone())
                    .unwrap_or_else(|| "subtask failed".to_string());
                self.revert(task, TaskState::Reverting, Some(reason)).await?;
            }
            return Ok(Progress::Terminal);
        }

        if !subtasks.iter().all(|s| s.state == SubtaskState::Succeeded) {
            return Ok(Progress::Waiting);
        }

        // Step complete; plan the next one or finalize.
        let next = task.step + 1;
        if self.plan_step(task, next).await? {
            debug!(task_id = task.id, step = next, "Advanced to next step");
            Ok(Progress::Waiting)
        } else {
            self.finalize_succeed(task).await?;
            Ok(Progress::Terminal)
        }
    }

    /// Plan and persist one step's subtasks. Returns false when the
    /// extension reports no more steps.
    async fn plan_step(&self, task: &Task, step: u64) -> Result<bool> {
        // The step may already be persisted if a prior attempt was cut
        // short between creating subtasks and committing the step
        // marker; planning twice would double-apply side effects.
        if !self.store.subtasks_for_step(task.id, step).await?.is_empty() {
            self.store.set_task_step(task.id, step).await?;
            return Ok(true);
        }

        let ext = self.registry.dispatcher_ext(task)?;
        let nodes = ext.eligible_nodes(task, &self.nodes);
        if nodes.is_empty() {
            return Err(Error::NoEligibleNodes(task.id));
        }

        let payloads = match ext.next_step_subtasks(task, step, &nodes).await {
            Ok(payloads) => payloads,
            // Transient planning failures are retried on a later tick;
            // everything else escalates to the revert path.
            Err(e) if ext.is_retryable_error(&e) => return Err(e),
            Err(e) => return Err(Error::planning_failed(task.id, step, e.to_string())),
        };
        if payloads.is_empty() {
            return Ok(false);
        }

        let subtasks = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| NewSubtask {
                task_id: task.id,
                step,
                node: nodes[i % nodes.len()].clone(),
                payload,
            })
            .collect::<Vec<_>>();

        info!(
            task_id = task.id,
            step,
            count = subtasks.len(),
            "Persisting step subtasks"
        );
        self.store.create_subtasks(subtasks).await?;
        self.store.set_task_step(task.id, step).await?;
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────
    // Terminal Paths
    // ─────────────────────────────────────────────────────────────

    /// Commit `Succeed` and run cleanup
    async fn finalize_succeed(&self, task: &Task) -> Result<()> {
        if self
            .store
            .finish_task(task.id, TaskState::Running, TaskState::Succeed, None)
            .await?
        {
            info!(task_id = task.id, key = %task.key, "Task succeeded");
            self.run_cleanup(task).await;
        }
        Ok(())
    }

    /// The single rollback routine shared by organic failure and
    /// external cancellation.
    ///
    /// Waits for in-flight subtasks to reach a terminal state, cancels
    /// never-run pending ones, then invokes `rollback` for every
    /// previously succeeded subtask in reverse step order (and reverse
    /// creation order within a step), marking each as cancelled once
    /// compensated.
    async fn revert(&self, task: &Task, from: TaskState, reason: Option<String>) -> Result<()> {
        info!(task_id = task.id, key = %task.key, from = %from, "Reverting task");

        self.drain_current_step(task, true).await?;

        let ext = self.registry.scheduler_ext(task)?;
        let mut rolled_back = 0u32;
        let mut rollback_failures = 0u32;
        for step in (1..=task.step).rev() {
            let mut subtasks = self.store.subtasks_for_step(task.id, step).await?;
            subtasks.retain(|s| s.state == SubtaskState::Succeeded);
            if subtasks.is_empty() {
                continue;
            }

            // One executor per step compensates that step's work.
            let mut executor = ext.executor(task, step)?;
            if let Err(e) = executor.init().await {
                warn!(task_id = task.id, step, error = %e, "Rollback executor init failed");
            }
            for subtask in subtasks.iter().rev() {
                match executor.rollback(subtask).await {
                    Ok(()) => {
                        rolled_back += 1;
                        debug!(subtask_id = subtask.id, step, "Subtask rolled back");
                    }
                    Err(e) => {
                        // Rollback failure does not change the outcome;
                        // it is recorded and the remaining compensations
                        // still run.
                        rollback_failures += 1;
                        let e = Error::RollbackFailed {
                            subtask_id: subtask.id,
                            message: e.to_string(),
                        };
                        warn!(task_id = task.id, step, error = %e, "Rollback failed");
                    }
                }
                self.store
                    .switch_subtask_state(
                        subtask.id,
                        SubtaskState::Succeeded,
                        SubtaskState::Cancelled,
                        None,
                    )
                    .await?;
            }
            if let Err(e) = executor.cleanup().await {
                warn!(task_id = task.id, step, error = %e, "Rollback executor cleanup failed");
            }
        }

        let reason = match (reason, rollback_failures) {
            (reason, 0) => reason,
            (Some(reason), n) => Some(format!("{reason}; {n} rollback(s) failed")),
            (None, n) => Some(format!("{n} rollback(s) failed")),
        };
        if self
            .store
            .finish_task(task.id, from, TaskState::Reverted, reason)
            .await?
        {
            info!(task_id = task.id, key = %task.key, rolled_back, "Task reverted");
            self.run_cleanup(task).await;
        }
        Ok(())
    }

    /// Park the task: wait for in-flight subtasks to finish, leave
    /// pending ones pending, and commit `Paused`. Nothing is rolled
    /// back and cleanup does not run; the task waits for an explicit
    /// resume.
    async fn pause(&self, task: &Task) -> Result<()> {
        self.drain_current_step(task, false).await?;
        if self
            .store
            .finish_task(task.id, TaskState::Pausing, TaskState::Paused, None)
            .await?
        {
            info!(task_id = task.id, key = %task.key, "Task paused");
        }
        Ok(())
    }

    /// Wait until no subtask of the current step is `Running`. With
    /// `cancel_pending`, never-run subtasks are marked cancelled first
    /// so nothing new starts.
    async fn drain_current_step(&self, task: &Task, cancel_pending: bool) -> Result<()> {
        let mut backoff = StoreBackoff::new(self.config.max_backoff);
        loop {
            let subtasks = match self.store.subtasks_for_step(task.id, task.step).await {
                Ok(subtasks) => subtasks,
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "Drain poll failed, backing off");
                    backoff.sleep().await;
                    continue;
                }
            };
            backoff.reset();

            if cancel_pending {
                for subtask in subtasks.iter().filter(|s| s.state == SubtaskState::Pending) {
                    self.store
                        .switch_subtask_state(
                            subtask.id,
                            SubtaskState::Pending,
                            SubtaskState::Cancelled,
                            None,
                        )
                        .await?;
                }
            }

            let in_flight = subtasks
                .iter()
                .filter(|s| s.state == SubtaskState::Running)
                .count();
            if in_flight == 0 {
                return Ok(());
            }
            debug!(task_id = task.id, in_flight, "Waiting for in-flight subtasks");
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Invoke the bound cleanup routine exactly once per terminal
    /// transition. Cleanup failure is logged and does not alter the
    /// already-committed terminal state.
    async fn run_cleanup(&self, task: &Task) {
        let routine = match self.registry.cleanup_routine(&task.task_type) {
            Ok(routine) => routine,
            Err(e) => {
                warn!(task_id = task.id, error = %e, "No cleanup routine");
                return;
            }
        };
        if let Err(e) = routine.clean_up(task).await {
            let e = Error::CleanupFailed {
                task_id: task.id,
                message: e.to_string(),
            };
            warn!(task_id = task.id, error = %e, "Cleanup routine failed");
        }
    }
}

enum Progress {
    /// The task reached a terminal state; the loop is done
    Terminal,
    /// Keep polling
    Waiting,
}
