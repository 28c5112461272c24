//! End-to-end framework tests
//!
//! Drives mock task types through the real runtime and asserts on
//! terminal states, rollback counts and partial-failure isolation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use taskgrid::faultinject::{
    FaultHooks, EXECUTOR_RUN_CANCEL, EXECUTOR_RUN_ERR, EXECUTOR_RUN_RETRYABLE_ERR,
};
use taskgrid::proto::SubtaskState;
use taskgrid::{ExtensionRegistry, MemTaskStore, NewSubtask, Runtime, TaskState, TaskStore};

use common::{
    dispatch_task, fast_config, register_mock_type, start_runtime, start_runtime_with_hooks,
    wait_live_state, wait_subtask_state, MockTaskType, TestContext, TEST_TASK_TYPE, WAIT_TIMEOUT,
};

// ─────────────────────────────────────────────────────────────────
// Success Path
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_step_task_succeeds() {
    let ctx = TestContext::new();
    let runtime = start_runtime(
        2,
        ctx.clone(),
        MockTaskType {
            steps: 2,
            per_step: 2,
            ..Default::default()
        },
    );

    let task = dispatch_task(&runtime, "key1").await;

    assert_eq!(task.state, TaskState::Succeed);
    // Both steps' side effects observed exactly once
    assert_eq!(ctx.effects_len(), 4);
    assert!(ctx.effects_exactly_once());
    assert_eq!(ctx.effect_count("key1/s1-0"), 1);
    assert_eq!(ctx.effect_count("key1/s2-1"), 1);
    assert_eq!(ctx.rollbacks(), 0);
    assert_eq!(ctx.cleanups(), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_single_step_single_node() {
    let ctx = TestContext::new();
    let runtime = start_runtime(
        1,
        ctx.clone(),
        MockTaskType {
            steps: 1,
            per_step: 1,
            ..Default::default()
        },
    );

    let task = dispatch_task(&runtime, "key1").await;

    assert_eq!(task.state, TaskState::Succeed);
    assert_eq!(ctx.effect_count("key1/s1-0"), 1);
    assert_eq!(ctx.cleanups(), 1);

    runtime.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Failure & Rollback
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_step_failure_rolls_back_prior_steps() {
    let ctx = TestContext::new();
    // Three steps, one subtask each; the third one fails terminally.
    let runtime = start_runtime(
        1,
        ctx.clone(),
        MockTaskType {
            steps: 3,
            per_step: 1,
            fail_key: Some("key1".to_string()),
            fail_step: 3,
            ..Default::default()
        },
    );

    let task = dispatch_task(&runtime, "key1").await;

    assert_eq!(task.state, TaskState::Reverted);
    // Rollback invoked for exactly the two previously succeeded subtasks
    assert_eq!(ctx.rollbacks(), 2);
    assert_eq!(ctx.effect_count("key1/s1-0"), 1);
    assert_eq!(ctx.effect_count("key1/s2-0"), 1);
    assert_eq!(ctx.effect_count("key1/s3-0"), 0);
    assert_eq!(ctx.cleanups(), 1);
    assert!(task.error.is_some());

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_injected_one_shot_fault_reverts() {
    let ctx = TestContext::new();
    let hooks = Arc::new(FaultHooks::new());
    let runtime = start_runtime_with_hooks(
        1,
        ctx.clone(),
        MockTaskType {
            steps: 2,
            per_step: 1,
            ..Default::default()
        },
        hooks.clone(),
    );

    // The fault fires on the very first execution, so nothing had
    // succeeded yet and the rollback count is zero.
    hooks.arm(EXECUTOR_RUN_ERR, Some("key1"), 1);
    let task = dispatch_task(&runtime, "key1").await;

    assert_eq!(task.state, TaskState::Reverted);
    assert_eq!(ctx.rollbacks(), 0);
    assert_eq!(ctx.effects_len(), 0);
    assert_eq!(ctx.cleanups(), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_failed_subtasks_marked_terminal() {
    let ctx = TestContext::new();
    let runtime = start_runtime(
        1,
        ctx.clone(),
        MockTaskType {
            steps: 2,
            per_step: 1,
            fail_key: Some("key1".to_string()),
            fail_step: 2,
            ..Default::default()
        },
    );

    let task = dispatch_task(&runtime, "key1").await;
    assert_eq!(task.state, TaskState::Reverted);

    // Task/subtask consistency: nothing non-terminal remains.
    let store = runtime.store();
    for step in 1..=2 {
        for subtask in store.subtasks_for_step(task.id, step).await.unwrap() {
            assert!(
                subtask.state.is_terminal(),
                "subtask {} left in {}",
                subtask.id,
                subtask.state
            );
        }
    }

    runtime.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Cancellation
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancellation_drives_rollback_path() {
    let ctx = TestContext::new();
    let hooks = Arc::new(FaultHooks::new());
    let runtime = start_runtime_with_hooks(
        1,
        ctx.clone(),
        MockTaskType {
            steps: 2,
            per_step: 1,
            ..Default::default()
        },
        hooks.clone(),
    );

    // Cancellation is injected during the first subtask's execution;
    // that subtask still completes, then the dispatcher observes the
    // signal and reverts.
    hooks.arm(EXECUTOR_RUN_CANCEL, Some("key1"), 1);
    let task = dispatch_task(&runtime, "key1").await;

    assert_eq!(task.state, TaskState::Reverted);
    // Rollback count matches the number of previously succeeded subtasks
    assert!(ctx.runs() >= 1);
    assert_eq!(ctx.rollbacks(), ctx.runs());
    assert_eq!(ctx.effect_count("key1/s1-0"), 1);
    assert_eq!(ctx.cleanups(), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_external_cancel_request() {
    let ctx = TestContext::new();
    let runtime = start_runtime(
        1,
        ctx.clone(),
        MockTaskType {
            steps: 2,
            per_step: 1,
            gated: true,
            ..Default::default()
        },
    );

    runtime
        .submit_task("key1", TEST_TASK_TYPE, 2, serde_json::Value::Null)
        .await
        .unwrap();
    wait_live_state(&runtime, "key1", TaskState::Running).await;

    // Cancel while the first subtask is blocked mid-execution, then
    // release it so the revert can drain.
    assert!(runtime.cancel_task("key1").await.unwrap());
    ctx.open_gate(100);

    let task = runtime.wait_task_exit("key1", WAIT_TIMEOUT).await.unwrap();
    assert_eq!(task.state, TaskState::Reverted);
    assert_eq!(ctx.cleanups(), 1);

    runtime.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Failure Isolation
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_tasks_fault_isolation() {
    let ctx = TestContext::new();
    // key0 fails at step 2; the other tasks share the type and nodes.
    let runtime = start_runtime(
        2,
        ctx.clone(),
        MockTaskType {
            steps: 2,
            per_step: 1,
            fail_key: Some("key0".to_string()),
            fail_step: 2,
            ..Default::default()
        },
    );

    for i in 0..3 {
        runtime
            .submit_task(&format!("key{i}"), TEST_TASK_TYPE, 2, serde_json::Value::Null)
            .await
            .unwrap();
    }

    let task0 = runtime.wait_task_exit("key0", WAIT_TIMEOUT).await.unwrap();
    let task1 = runtime.wait_task_exit("key1", WAIT_TIMEOUT).await.unwrap();
    let task2 = runtime.wait_task_exit("key2", WAIT_TIMEOUT).await.unwrap();

    // The injected fault never leaks into unrelated tasks.
    assert_eq!(task0.state, TaskState::Reverted);
    assert_eq!(task1.state, TaskState::Succeed);
    assert_eq!(task2.state, TaskState::Succeed);

    // Only key0's step-1 subtask was compensated.
    assert_eq!(ctx.rollbacks(), 1);
    assert_eq!(ctx.effect_count("key1/s1-0"), 1);
    assert_eq!(ctx.effect_count("key1/s2-0"), 1);
    assert_eq!(ctx.effect_count("key2/s2-0"), 1);
    // Cleanup once per task, regardless of outcome.
    assert_eq!(ctx.cleanups(), 3);

    runtime.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Pause & Resume
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pause_drains_and_resume_completes() {
    let ctx = TestContext::new();
    let runtime = start_runtime(
        1,
        ctx.clone(),
        MockTaskType {
            steps: 2,
            per_step: 1,
            gated: true,
            ..Default::default()
        },
    );

    runtime
        .submit_task("key1", TEST_TASK_TYPE, 2, serde_json::Value::Null)
        .await
        .unwrap();
    // Wait until the first subtask is claimed and blocked on the gate.
    wait_subtask_state(&runtime, "key1", 1, SubtaskState::Running).await;

    // Pause while the first subtask is in flight.
    assert!(runtime.pause_task("key1").await.unwrap());
    // The drain cannot finish until the in-flight subtask does.
    ctx.open_gate(1);
    wait_live_state(&runtime, "key1", TaskState::Paused).await;

    // The in-flight subtask ran to completion; nothing was rolled back
    // and cleanup has not fired.
    assert_eq!(ctx.effect_count("key1/s1-0"), 1);
    assert_eq!(ctx.rollbacks(), 0);
    assert_eq!(ctx.cleanups(), 0);

    // Explicit resume finishes the remaining step.
    ctx.open_gate(100);
    assert!(runtime.resume_task("key1").await.unwrap());
    let task = runtime.wait_task_exit("key1", WAIT_TIMEOUT).await.unwrap();

    assert_eq!(task.state, TaskState::Succeed);
    assert!(ctx.effects_exactly_once());
    assert_eq!(ctx.effect_count("key1/s2-0"), 1);
    assert_eq!(ctx.cleanups(), 1);

    runtime.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Retry Policy
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_transient_failures_retried_within_budget() {
    let ctx = TestContext::new();
    let hooks = Arc::new(FaultHooks::new());
    let runtime = start_runtime_with_hooks(
        1,
        ctx.clone(),
        MockTaskType {
            steps: 1,
            per_step: 1,
            ..Default::default()
        },
        hooks.clone(),
    );

    // Two transient failures, then success on the third attempt
    // (budget is three).
    hooks.arm(EXECUTOR_RUN_RETRYABLE_ERR, Some("key1"), 2);
    let task = dispatch_task(&runtime, "key1").await;

    assert_eq!(task.state, TaskState::Succeed);
    assert_eq!(ctx.effect_count("key1/s1-0"), 1);

    let subtasks = runtime.store().subtasks_for_step(task.id, 1).await.unwrap();
    assert_eq!(subtasks.len(), 1);
    assert_eq!(subtasks[0].attempts, 3);
    assert_eq!(subtasks[0].state, SubtaskState::Succeeded);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_retry_budget_exhaustion_reverts() {
    let ctx = TestContext::new();
    let hooks = Arc::new(FaultHooks::new());
    let runtime = start_runtime_with_hooks(
        1,
        ctx.clone(),
        MockTaskType {
            steps: 1,
            per_step: 1,
            ..Default::default()
        },
        hooks.clone(),
    );

    // More transient failures than the budget allows.
    hooks.arm(EXECUTOR_RUN_RETRYABLE_ERR, Some("key1"), 10);
    let task = dispatch_task(&runtime, "key1").await;

    assert_eq!(task.state, TaskState::Reverted);
    assert_eq!(ctx.rollbacks(), 0);
    assert_eq!(ctx.effects_len(), 0);

    let subtasks = runtime.store().subtasks_for_step(task.id, 1).await.unwrap();
    assert_eq!(subtasks[0].attempts, 3);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_non_idempotent_transient_failure_not_retried() {
    let ctx = TestContext::new();
    let hooks = Arc::new(FaultHooks::new());
    let runtime = start_runtime_with_hooks(
        1,
        ctx.clone(),
        MockTaskType {
            steps: 1,
            per_step: 1,
            idempotent: false,
            ..Default::default()
        },
        hooks.clone(),
    );

    // A single transient failure: retryable in principle, but the type
    // is not idempotent, so re-execution is unsafe and the task reverts.
    hooks.arm(EXECUTOR_RUN_RETRYABLE_ERR, Some("key1"), 1);
    let task = dispatch_task(&runtime, "key1").await;

    assert_eq!(task.state, TaskState::Reverted);
    let subtasks = runtime.store().subtasks_for_step(task.id, 1).await.unwrap();
    assert_eq!(subtasks[0].attempts, 1);

    runtime.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Resume After Interruption
// ─────────────────────────────────────────────────────────────────

/// Seed a store with a running task whose subtask was interrupted
/// mid-execution by a previous owner.
async fn seed_interrupted_task(store: &MemTaskStore) -> i64 {
    let task_id = store
        .create_task("key1", TEST_TASK_TYPE, 2, serde_json::Value::Null)
        .await
        .unwrap();
    assert!(store
        .switch_task_state(task_id, TaskState::Pending, TaskState::Running)
        .await
        .unwrap());
    let ids = store
        .create_subtasks(vec![NewSubtask {
            task_id,
            step: 1,
            node: "node-1".to_string(),
            payload: serde_json::json!({ "step": 1, "slot": 0 }),
        }])
        .await
        .unwrap();
    store.set_task_step(task_id, 1).await.unwrap();
    assert!(store
        .switch_subtask_state(ids[0], SubtaskState::Pending, SubtaskState::Running, None)
        .await
        .unwrap());
    task_id
}

#[tokio::test]
async fn test_interrupted_idempotent_subtask_reruns() {
    let store = Arc::new(MemTaskStore::new());
    seed_interrupted_task(&store).await;

    let ctx = TestContext::new();
    let registry = Arc::new(ExtensionRegistry::new());
    register_mock_type(
        &registry,
        ctx.clone(),
        MockTaskType {
            steps: 1,
            per_step: 1,
            ..Default::default()
        },
    );
    let runtime = Runtime::new(store, registry, fast_config(1));
    runtime.start();

    // The adopting dispatcher resets the in-flight subtask and the task
    // completes normally.
    let task = runtime.wait_task_exit("key1", WAIT_TIMEOUT).await.unwrap();
    assert_eq!(task.state, TaskState::Succeed);
    assert_eq!(ctx.effect_count("key1/s1-0"), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_interrupted_non_idempotent_subtask_reverts() {
    let store = Arc::new(MemTaskStore::new());
    seed_interrupted_task(&store).await;

    let ctx = TestContext::new();
    let registry = Arc::new(ExtensionRegistry::new());
    register_mock_type(
        &registry,
        ctx.clone(),
        MockTaskType {
            steps: 1,
            per_step: 1,
            idempotent: false,
            ..Default::default()
        },
    );
    let runtime = Runtime::new(store, registry, fast_config(1));
    runtime.start();

    // Re-running is unsafe, so the at-least-once risk is surfaced as a
    // revert rather than a silent double-apply.
    let task = runtime.wait_task_exit("key1", WAIT_TIMEOUT).await.unwrap();
    assert_eq!(task.state, TaskState::Reverted);
    assert_eq!(ctx.effects_len(), 0);
    assert_eq!(ctx.cleanups(), 1);

    runtime.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// Store Unavailability
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_store_outage_backoff_and_recover() {
    let store = Arc::new(MemTaskStore::new());
    let ctx = TestContext::new();
    let registry = Arc::new(ExtensionRegistry::new());
    register_mock_type(
        &registry,
        ctx.clone(),
        MockTaskType {
            steps: 2,
            per_step: 1,
            ..Default::default()
        },
    );
    let runtime = Runtime::new(store.clone(), registry, fast_config(1));
    runtime.start();

    runtime
        .submit_task("key1", TEST_TASK_TYPE, 2, serde_json::Value::Null)
        .await
        .unwrap();

    // Every loop hits the outage window, backs off and retries; the
    // task still completes once the store recovers.
    store.inject_outages(20);

    let task = runtime.wait_task_exit("key1", WAIT_TIMEOUT).await.unwrap();
    assert_eq!(task.state, TaskState::Succeed);
    assert!(ctx.effects_exactly_once());

    runtime.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────
// History
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_terminal_task_queryable_from_history() {
    let ctx = TestContext::new();
    let runtime = start_runtime(1, ctx.clone(), MockTaskType::default());

    let task = dispatch_task(&runtime, "key1").await;
    assert_eq!(task.state, TaskState::Succeed);

    let store = runtime.store();
    // Gone from the live view, present in history.
    assert!(store.task_by_key("key1").await.unwrap().is_none());
    let historical = store.task_history_by_key("key1").await.unwrap().unwrap();
    assert_eq!(historical.id, task.id);
    assert_eq!(historical.state, TaskState::Succeed);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_wait_task_exit_times_out_when_not_started() {
    let registry = Arc::new(ExtensionRegistry::new());
    let ctx = TestContext::new();
    register_mock_type(&registry, ctx, MockTaskType::default());
    let runtime = Runtime::new(Arc::new(MemTaskStore::new()), registry, fast_config(1));
    // Runtime never started: nothing claims the task.

    runtime
        .submit_task("key1", TEST_TASK_TYPE, 2, serde_json::Value::Null)
        .await
        .unwrap();
    let result = runtime
        .wait_task_exit("key1", Duration::from_millis(200))
        .await;
    assert!(result.is_err());
}
