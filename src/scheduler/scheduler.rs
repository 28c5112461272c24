//! Per-(node, task) execution loop
//!
//! Claims pending subtasks assigned to this node, runs them through the
//! task type's executor and reports results back to the store. All
//! claims are conditional state switches; a rejected claim means another
//! agent moved first and is simply skipped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::faultinject::{
    FaultHooks, EXECUTOR_RUN_CANCEL, EXECUTOR_RUN_ERR, EXECUTOR_RUN_RETRYABLE_ERR,
};
use crate::poll::StoreBackoff;
use crate::proto::{Subtask, SubtaskState, Task, TaskState};
use crate::scheduler::SchedulerExtension;
use crate::storage::TaskStore;

// ─────────────────────────────────────────────────────────────────
// Scheduler Configuration
// ─────────────────────────────────────────────────────────────────

/// Tuning knobs for the scheduler loop
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between store polls
    pub poll_interval: Duration,

    /// In-place retry budget per subtask (idempotent types only)
    pub subtask_retry_budget: u32,

    /// Upper bound for the store-unavailability backoff
    pub max_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            subtask_retry_budget: 3,
            max_backoff: Duration::from_secs(5),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────

/// Executes one task's subtasks on one node, for the task's lifetime
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    ext: Arc<dyn SchedulerExtension>,
    hooks: Arc<FaultHooks>,
    config: SchedulerConfig,
    node: String,
    task_id: i64,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    /// Create a scheduler bound to one (node, task) pair
    pub fn new(
        store: Arc<dyn TaskStore>,
        ext: Arc<dyn SchedulerExtension>,
        hooks: Arc<FaultHooks>,
        config: SchedulerConfig,
        node: String,
        task_id: i64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            ext,
            hooks,
            config,
            node,
            task_id,
            shutdown,
        }
    }

    /// Run until the task leaves `Running` or shutdown is signalled
    pub async fn run(self) {
        debug!(task_id = self.task_id, node = %self.node, "Scheduler started");
        let mut backoff = StoreBackoff::new(self.config.max_backoff);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let task = match self.store.task_by_id(self.task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) => {
                    warn!(task_id = self.task_id, error = %e, "Store poll failed, backing off");
                    backoff.sleep().await;
                    continue;
                }
            };
            backoff.reset();

            // Only a running task hands out work; anything else ends
            // this scheduler's lifetime.
            if task.state != TaskState::Running {
                break;
            }

            match self.execute_round(&task).await {
                Ok(_) => {}
                Err(e) => {
                    warn!(task_id = self.task_id, node = %self.node, error = %e,
                          "Execution round failed, backing off");
                    backoff.sleep().await;
                    continue;
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        debug!(task_id = self.task_id, node = %self.node, "Scheduler stopped");
    }

    /// Claim up to `task.concurrency` pending subtasks and execute them
    /// in parallel
    async fn execute_round(&self, task: &Task) -> Result<()> {
        let claimable = self
            .store
            .claimable_subtasks(task.id, &self.node)
            .await?;
        if claimable.is_empty() {
            return Ok(());
        }

        let mut handles = Vec::new();
        // A zero concurrency hint still makes progress, one at a time.
        let slots = (task.concurrency.max(1)) as usize;
        for subtask in claimable.into_iter().take(slots) {
            // Conditional claim; a rejected switch means someone else
            // moved first.
            if !self
                .store
                .switch_subtask_state(
                    subtask.id,
                    SubtaskState::Pending,
                    SubtaskState::Running,
                    None,
                )
                .await?
            {
                continue;
            }

            let store = self.store.clone();
            let ext = self.ext.clone();
            let hooks = self.hooks.clone();
            let config = self.config.clone();
            let task = task.clone();
            let node = self.node.clone();

            handles.push(tokio::spawn(async move {
                execute_subtask(store, ext, hooks, config, task, node, subtask).await;
            }));
        }

        for handle in handles {
            // A panicked execution task is folded into the round result
            if let Err(e) = handle.await {
                return Err(Error::Internal(format!("subtask execution panicked: {e}")));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Subtask Execution
// ─────────────────────────────────────────────────────────────────

/// Run one claimed subtask through the executor contract and report the
/// outcome back to the store
async fn execute_subtask(
    store: Arc<dyn TaskStore>,
    ext: Arc<dyn SchedulerExtension>,
    hooks: Arc<FaultHooks>,
    config: SchedulerConfig,
    task: Task,
    node: String,
    subtask: Subtask,
) {
    let attempts = match store.record_subtask_attempt(subtask.id).await {
        Ok(n) => n,
        Err(e) => {
            warn!(subtask_id = subtask.id, error = %e, "Failed to record attempt");
            subtask.attempts + 1
        }
    };

    info!(
        task_id = task.id,
        subtask_id = subtask.id,
        step = subtask.step,
        node = %node,
        attempts,
        "Executing subtask"
    );

    let mut executor = match ext.executor(&task, subtask.step) {
        Ok(executor) => executor,
        Err(e) => {
            report_failure(&store, &ext, &config, &subtask, attempts, e).await;
            return;
        }
    };

    // Scoped acquisition; failure skips run_subtask entirely.
    if let Err(e) = executor.init().await {
        report_failure(
            &store,
            &ext,
            &config,
            &subtask,
            attempts,
            Error::ExecutorInitFailed(e.to_string()),
        )
        .await;
        return;
    }

    // Injected cancellation: record the external signal, then keep
    // executing normally. The dispatcher observes the flag and drives
    // the same revert path as an organic failure.
    if hooks.hit(EXECUTOR_RUN_CANCEL, &task.key) {
        info!(task_id = task.id, "Injected cancellation signal");
        if let Err(e) = store.request_cancel(task.id).await {
            warn!(task_id = task.id, error = %e, "Failed to record injected cancel");
        }
    }

    let run_result = if hooks.hit(EXECUTOR_RUN_ERR, &task.key) {
        Err(Error::execution_failed("injected execution failure"))
    } else if hooks.hit(EXECUTOR_RUN_RETRYABLE_ERR, &task.key) {
        Err(Error::execution_failed_transient("injected transient failure"))
    } else {
        executor.run_subtask(&subtask).await
    };

    // Post-processing failure counts as subtask failure.
    let outcome = match run_result {
        Ok(()) => executor.on_finished(&subtask).await,
        Err(e) => Err(e),
    };

    // Scoped release, regardless of outcome.
    if let Err(e) = executor.cleanup().await {
        warn!(subtask_id = subtask.id, error = %e, "Executor cleanup failed");
    }

    match outcome {
        Ok(()) => {
            if switch_with_retry(
                &store,
                &config,
                subtask.id,
                SubtaskState::Running,
                SubtaskState::Succeeded,
                None,
            )
            .await
            {
                info!(task_id = task.id, subtask_id = subtask.id, "Subtask succeeded");
            } else {
                debug!(subtask_id = subtask.id, "Subtask already moved by another agent");
            }
        }
        Err(e) => report_failure(&store, &ext, &config, &subtask, attempts, e).await,
    }
}

/// Retry a result report until the store accepts or rejects it. A lost
/// report would strand the subtask in `Running` forever, so the loop
/// only gives up once the store answers.
async fn switch_with_retry(
    store: &Arc<dyn TaskStore>,
    config: &SchedulerConfig,
    subtask_id: i64,
    from: SubtaskState,
    to: SubtaskState,
    error: Option<String>,
) -> bool {
    let mut backoff = StoreBackoff::new(config.max_backoff);
    loop {
        match store
            .switch_subtask_state(subtask_id, from, to, error.clone())
            .await
        {
            Ok(committed) => return committed,
            Err(e) => {
                warn!(subtask_id, error = %e, "Failed to report subtask state, retrying");
                backoff.sleep().await;
            }
        }
    }
}

/// Decide between in-place retry and terminal failure
async fn report_failure(
    store: &Arc<dyn TaskStore>,
    ext: &Arc<dyn SchedulerExtension>,
    config: &SchedulerConfig,
    subtask: &Subtask,
    attempts: u32,
    error: Error,
) {
    let retry = error.is_retryable()
        && ext.is_idempotent(subtask)
        && attempts < config.subtask_retry_budget;

    if retry {
        info!(
            subtask_id = subtask.id,
            attempts,
            budget = config.subtask_retry_budget,
            error = %error,
            "Transient subtask failure, retrying in place"
        );
        switch_with_retry(
            store,
            config,
            subtask.id,
            SubtaskState::Running,
            SubtaskState::Pending,
            None,
        )
        .await;
        return;
    }

    // Budget exhaustion is recorded as such; other terminal failures
    // keep their original error.
    let exhausted = error.is_retryable() && ext.is_idempotent(subtask);
    let recorded = if exhausted {
        Error::RetriesExhausted {
            subtask_id: subtask.id,
            attempts,
        }
        .format_for_log()
    } else {
        error.format_for_log()
    };

    warn!(
        subtask_id = subtask.id,
        attempts,
        error = %error,
        "Terminal subtask failure"
    );
    switch_with_retry(
        store,
        config,
        subtask.id,
        SubtaskState::Running,
        SubtaskState::Failed,
        Some(recorded),
    )
    .await;
}
