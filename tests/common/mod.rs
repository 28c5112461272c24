//! Common test utilities and fixtures
//!
//! Mock task types, side-effect recording and dispatch helpers shared
//! by the framework integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use taskgrid::dispatch::{CleanupRoutine, DispatcherExtension};
use taskgrid::scheduler::{SchedulerExtension, SubtaskExecutor};
use taskgrid::{
    Error, ExtensionRegistry, MemTaskStore, Result, Runtime, RuntimeConfig, Subtask, SubtaskState,
    Task, TaskState, TaskStore,
};

/// Task type used by every mock registration
pub const TEST_TASK_TYPE: &str = "example";

/// How long dispatch helpers wait before declaring a hang
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

// ─────────────────────────────────────────────────────────────────
// Test Context
// ─────────────────────────────────────────────────────────────────

/// Shared recorder for observable side effects of mock executors
pub struct TestContext {
    /// Per-subtask side-effect counters, keyed "key/s<step>-<slot>"
    effects: Mutex<HashMap<String, u32>>,

    /// Rollback invocations across all tasks
    pub rollback_cnt: AtomicU32,

    /// Cleanup routine invocations across all tasks
    pub cleanup_cnt: AtomicU32,

    /// Successful run_subtask invocations
    pub run_cnt: AtomicU32,

    /// Gate blocking gated executors until permits are released
    pub gate: Semaphore,
}

impl TestContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            effects: Mutex::new(HashMap::new()),
            rollback_cnt: AtomicU32::new(0),
            cleanup_cnt: AtomicU32::new(0),
            run_cnt: AtomicU32::new(0),
            gate: Semaphore::new(0),
        })
    }

    fn record_effect(&self, key: &str) {
        let mut effects = self.effects.lock().unwrap();
        *effects.entry(key.to_string()).or_insert(0) += 1;
    }

    /// How many times the given side effect was applied
    pub fn effect_count(&self, key: &str) -> u32 {
        self.effects.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// Number of distinct side effects applied
    pub fn effects_len(&self) -> usize {
        self.effects.lock().unwrap().len()
    }

    /// True when every recorded side effect was applied exactly once
    pub fn effects_exactly_once(&self) -> bool {
        self.effects.lock().unwrap().values().all(|&n| n == 1)
    }

    pub fn rollbacks(&self) -> u32 {
        self.rollback_cnt.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> u32 {
        self.cleanup_cnt.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> u32 {
        self.run_cnt.load(Ordering::SeqCst)
    }

    /// Unblock gated executors
    pub fn open_gate(&self, permits: usize) {
        self.gate.add_permits(permits);
    }
}

// ─────────────────────────────────────────────────────────────────
// Mock Task Type
// ─────────────────────────────────────────────────────────────────

/// Shape of the mock task type registered for a test case
#[derive(Clone)]
pub struct MockTaskType {
    /// Number of steps before the task completes
    pub steps: u64,

    /// Subtask payloads per step
    pub per_step: usize,

    /// Idempotency declared to the framework
    pub idempotent: bool,

    /// Executors block on the context gate before running
    pub gated: bool,

    /// Fail `run_subtask` terminally for this task key at `fail_step`
    pub fail_key: Option<String>,

    /// Step at which the planned failure fires
    pub fail_step: u64,
}

impl Default for MockTaskType {
    fn default() -> Self {
        Self {
            steps: 2,
            per_step: 1,
            idempotent: true,
            gated: false,
            fail_key: None,
            fail_step: 0,
        }
    }
}

struct MockDispatcherExt {
    shape: MockTaskType,
}

#[async_trait]
impl DispatcherExtension for MockDispatcherExt {
    async fn next_step_subtasks(
        &self,
        _task: &Task,
        step: u64,
        _nodes: &[String],
    ) -> Result<Vec<serde_json::Value>> {
        if step > self.shape.steps {
            return Ok(Vec::new());
        }
        Ok((0..self.shape.per_step)
            .map(|slot| json!({ "step": step, "slot": slot }))
            .collect())
    }
}

struct MockSchedulerExt {
    ctx: Arc<TestContext>,
    shape: MockTaskType,
    task_key: String,
}

#[async_trait]
impl SchedulerExtension for MockSchedulerExt {
    fn is_idempotent(&self, _subtask: &Subtask) -> bool {
        self.shape.idempotent
    }

    fn executor(&self, _task: &Task, _step: u64) -> Result<Box<dyn SubtaskExecutor>> {
        Ok(Box::new(MockExecutor {
            ctx: self.ctx.clone(),
            shape: self.shape.clone(),
            task_key: self.task_key.clone(),
        }))
    }
}

struct MockExecutor {
    ctx: Arc<TestContext>,
    shape: MockTaskType,
    task_key: String,
}

impl MockExecutor {
    fn effect_key(&self, subtask: &Subtask) -> String {
        let step = subtask.payload.get("step").and_then(|v| v.as_u64()).unwrap_or(0);
        let slot = subtask.payload.get("slot").and_then(|v| v.as_u64()).unwrap_or(0);
        format!("{}/s{}-{}", self.task_key, step, slot)
    }
}

#[async_trait]
impl SubtaskExecutor for MockExecutor {
    async fn run_subtask(&mut self, subtask: &Subtask) -> Result<()> {
        if let Some(fail_key) = &self.shape.fail_key {
            if *fail_key == self.task_key && subtask.step == self.shape.fail_step {
                return Err(Error::execution_failed("planned failure"));
            }
        }
        if self.shape.gated {
            let permit = self
                .ctx
                .gate
                .acquire()
                .await
                .map_err(|_| Error::execution_failed("gate closed"))?;
            permit.forget();
        }
        self.ctx.record_effect(&self.effect_key(subtask));
        self.ctx.run_cnt.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self, _subtask: &Subtask) -> Result<()> {
        self.ctx.rollback_cnt.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockCleanup {
    ctx: Arc<TestContext>,
}

#[async_trait]
impl CleanupRoutine for MockCleanup {
    async fn clean_up(&self, _task: &Task) -> Result<()> {
        self.ctx.cleanup_cnt.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Register mock dispatcher, scheduler and cleanup factories for the
/// test task type
pub fn register_mock_type(registry: &ExtensionRegistry, ctx: Arc<TestContext>, shape: MockTaskType) {
    let dispatcher_shape = shape.clone();
    registry.register_dispatcher(TEST_TASK_TYPE, Arc::new(move |_task| {
        Arc::new(MockDispatcherExt {
            shape: dispatcher_shape.clone(),
        })
    }));

    let scheduler_ctx = ctx.clone();
    let scheduler_shape = shape;
    registry.register_scheduler(TEST_TASK_TYPE, Arc::new(move |task| {
        Arc::new(MockSchedulerExt {
            ctx: scheduler_ctx.clone(),
            shape: scheduler_shape.clone(),
            task_key: task.key.clone(),
        })
    }));

    registry.register_cleanup(TEST_TASK_TYPE, Arc::new(move || {
        Arc::new(MockCleanup { ctx: ctx.clone() })
    }));
}

// ─────────────────────────────────────────────────────────────────
// Harness Helpers
// ─────────────────────────────────────────────────────────────────

/// Runtime configuration with short polls suited to tests
pub fn fast_config(nodes: usize) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.nodes = (1..=nodes).map(|i| format!("node-{i}")).collect();
    config.dispatch.poll_interval = Duration::from_millis(10);
    config.dispatch.max_backoff = Duration::from_millis(200);
    config.scheduler.poll_interval = Duration::from_millis(10);
    config.scheduler.max_backoff = Duration::from_millis(200);
    config
}

/// Build and start a runtime with the mock type registered
pub fn start_runtime(nodes: usize, ctx: Arc<TestContext>, shape: MockTaskType) -> Runtime {
    start_runtime_with_hooks(nodes, ctx, shape, Arc::new(taskgrid::faultinject::FaultHooks::new()))
}

/// Build and start a runtime with the mock type registered and the
/// given fault hooks installed
pub fn start_runtime_with_hooks(
    nodes: usize,
    ctx: Arc<TestContext>,
    shape: MockTaskType,
    hooks: Arc<taskgrid::faultinject::FaultHooks>,
) -> Runtime {
    let registry = Arc::new(ExtensionRegistry::new());
    register_mock_type(&registry, ctx, shape);
    let runtime = Runtime::new(Arc::new(MemTaskStore::new()), registry, fast_config(nodes))
        .with_fault_hooks(hooks);
    runtime.start();
    runtime
}

/// Submit one task and wait for it to exit
pub async fn dispatch_task(runtime: &Runtime, key: &str) -> Task {
    runtime
        .submit_task(key, TEST_TASK_TYPE, 2, serde_json::Value::Null)
        .await
        .expect("submit failed");
    runtime
        .wait_task_exit(key, WAIT_TIMEOUT)
        .await
        .expect("task did not exit")
}

/// Poll the store until the live task reaches the given state
pub async fn wait_live_state(runtime: &Runtime, key: &str, state: TaskState) {
    let store = runtime.store();
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if let Some(task) = store.task_by_key(key).await.expect("store failed") {
            if task.state == state {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for task '{key}' to reach {state}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll the store until some subtask of the given step reaches `state`
pub async fn wait_subtask_state(runtime: &Runtime, key: &str, step: u64, state: SubtaskState) {
    let store = runtime.store();
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if let Some(task) = store.task_by_key(key).await.expect("store failed") {
            let subtasks = store
                .subtasks_for_step(task.id, step)
                .await
                .expect("store failed");
            if subtasks.iter().any(|s| s.state == state) {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for a step-{step} subtask of '{key}' in {state}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until a side effect has been recorded
pub async fn wait_effect(ctx: &TestContext, key: &str) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if ctx.effect_count(key) > 0 {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for side effect '{key}'"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
