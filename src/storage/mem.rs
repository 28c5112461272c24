//! In-memory task store
//!
//! Reference implementation of [`TaskStore`] backing the node binary and
//! the test harness. All records live behind a single `parking_lot`
//! RwLock; conditional updates compare the stored state against the
//! caller's expectation before committing, which is all the optimistic
//! concurrency the framework relies on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::proto::{NewSubtask, Subtask, SubtaskState, Task, TaskState};

use super::TaskStore;

#[derive(Default)]
struct MemInner {
    next_task_id: i64,
    next_subtask_id: i64,
    /// Live (non-terminal) tasks by id
    tasks: HashMap<i64, Task>,
    /// Terminal tasks, immutable, by id
    history: HashMap<i64, Task>,
    /// Key index over live and historical tasks
    keys: HashMap<String, i64>,
    /// All subtasks by id
    subtasks: HashMap<i64, Subtask>,
}

/// Thread-safe in-memory [`TaskStore`]
pub struct MemTaskStore {
    inner: RwLock<MemInner>,
    /// Remaining operations to reject with `StoreUnavailable`; harness
    /// hook for exercising the backoff-and-retry paths
    outages: AtomicU32,
}

impl MemTaskStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemInner::default()),
            outages: AtomicU32::new(0),
        }
    }

    /// Make the next `n` store operations fail with `StoreUnavailable`
    pub fn inject_outages(&self, n: u32) {
        self.outages.store(n, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        loop {
            let current = self.outages.load(Ordering::SeqCst);
            if current == 0 {
                return Ok(());
            }
            if self
                .outages
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(Error::StoreUnavailable("injected outage".to_string()));
            }
        }
    }
}

impl Default for MemTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemTaskStore {
    async fn create_task(
        &self,
        key: &str,
        task_type: &str,
        concurrency: u32,
        meta: serde_json::Value,
    ) -> Result<i64> {
        self.check_available()?;
        let mut inner = self.inner.write();
        if inner.keys.contains_key(key) {
            return Err(Error::DuplicateTaskKey(key.to_string()));
        }
        inner.next_task_id += 1;
        let id = inner.next_task_id;
        let now = Utc::now();
        let task = Task {
            id,
            key: key.to_string(),
            task_type: task_type.to_string(),
            state: TaskState::Pending,
            step: 0,
            concurrency,
            meta,
            error: None,
            cancel_requested: false,
            pause_requested: false,
            created_at: now,
            updated_at: now,
        };
        inner.keys.insert(key.to_string(), id);
        inner.tasks.insert(id, task);
        Ok(id)
    }

    async fn task_by_id(&self, task_id: i64) -> Result<Option<Task>> {
        self.check_available()?;
        Ok(self.inner.read().tasks.get(&task_id).cloned())
    }

    async fn task_by_key(&self, key: &str) -> Result<Option<Task>> {
        self.check_available()?;
        let inner = self.inner.read();
        Ok(inner
            .keys
            .get(key)
            .and_then(|id| inner.tasks.get(id))
            .cloned())
    }

    async fn task_history_by_key(&self, key: &str) -> Result<Option<Task>> {
        self.check_available()?;
        let inner = self.inner.read();
        let id = match inner.keys.get(key) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(inner
            .tasks
            .get(&id)
            .or_else(|| inner.history.get(&id))
            .cloned())
    }

    async fn tasks_in_states(&self, states: &[TaskState]) -> Result<Vec<Task>> {
        self.check_available()?;
        let inner = self.inner.read();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| states.contains(&t.state))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn switch_task_state(
        &self,
        task_id: i64,
        from: TaskState,
        to: TaskState,
    ) -> Result<bool> {
        self.check_available()?;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { task_id, from, to });
        }
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        if task.state != from {
            return Ok(false);
        }
        task.state = to;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn finish_task(
        &self,
        task_id: i64,
        from: TaskState,
        to: TaskState,
        error: Option<String>,
    ) -> Result<bool> {
        self.check_available()?;
        if !to.is_terminal() {
            return Err(Error::Internal(format!(
                "finish_task called with non-terminal state {to}"
            )));
        }
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { task_id, from, to });
        }
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        if task.state != from {
            return Ok(false);
        }
        task.state = to;
        task.updated_at = Utc::now();
        if let Some(err) = error {
            task.error = Some(err);
        }
        // Paused tasks stay live so resume can find them; Succeed and
        // Reverted retire to history.
        if to != TaskState::Paused {
            if let Some(task) = inner.tasks.remove(&task_id) {
                inner.history.insert(task_id, task);
            }
        }
        Ok(true)
    }

    async fn set_task_step(&self, task_id: i64, step: u64) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        task.step = step;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn request_cancel(&self, task_id: i64) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.write();
        match inner.tasks.get_mut(&task_id) {
            Some(task) if task.state.is_active() => {
                task.cancel_requested = true;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn request_pause(&self, task_id: i64) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.write();
        match inner.tasks.get_mut(&task_id) {
            Some(task) if task.state == TaskState::Running => {
                task.pause_requested = true;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn resume_task(&self, task_id: i64) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.write();
        match inner.tasks.get_mut(&task_id) {
            Some(task) if task.state == TaskState::Paused => {
                task.state = TaskState::Running;
                task.pause_requested = false;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_subtasks(&self, subtasks: Vec<NewSubtask>) -> Result<Vec<i64>> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let now = Utc::now();
        let mut ids = Vec::with_capacity(subtasks.len());
        for spec in subtasks {
            inner.next_subtask_id += 1;
            let id = inner.next_subtask_id;
            let subtask = Subtask {
                id,
                task_id: spec.task_id,
                step: spec.step,
                node: spec.node,
                state: SubtaskState::Pending,
                payload: spec.payload,
                attempts: 0,
                error: None,
                created_at: now,
                updated_at: now,
            };
            inner.subtasks.insert(id, subtask);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn subtasks_for_step(&self, task_id: i64, step: u64) -> Result<Vec<Subtask>> {
        self.check_available()?;
        let inner = self.inner.read();
        let mut subtasks: Vec<Subtask> = inner
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id && s.step == step)
            .cloned()
            .collect();
        subtasks.sort_by_key(|s| s.id);
        Ok(subtasks)
    }

    async fn claimable_subtasks(&self, task_id: i64, node: &str) -> Result<Vec<Subtask>> {
        self.check_available()?;
        let inner = self.inner.read();
        let mut subtasks: Vec<Subtask> = inner
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id && s.node == node && s.state == SubtaskState::Pending)
            .cloned()
            .collect();
        subtasks.sort_by_key(|s| s.id);
        Ok(subtasks)
    }

    async fn switch_subtask_state(
        &self,
        subtask_id: i64,
        from: SubtaskState,
        to: SubtaskState,
        error: Option<String>,
    ) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let subtask = inner
            .subtasks
            .get_mut(&subtask_id)
            .ok_or(Error::SubtaskNotFound(subtask_id))?;
        if subtask.state != from {
            return Ok(false);
        }
        subtask.state = to;
        subtask.updated_at = Utc::now();
        if let Some(err) = error {
            subtask.error = Some(err);
        }
        Ok(true)
    }

    async fn record_subtask_attempt(&self, subtask_id: i64) -> Result<u32> {
        self.check_available()?;
        let mut inner = self.inner.write();
        let subtask = inner
            .subtasks
            .get_mut(&subtask_id)
            .ok_or(Error::SubtaskNotFound(subtask_id))?;
        subtask.attempts += 1;
        subtask.updated_at = Utc::now();
        Ok(subtask.attempts)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
