//! Fault injection hooks
//!
//! Named injection points used by the test harness to force a subtask
//! failure or a cancellation signal at a deterministic spot in the
//! execution path. Points are inert unless armed; the production
//! surface never arms them. A point can be scoped to a single task key
//! so that concurrent unrelated tasks are unaffected.

use parking_lot::Mutex;

/// Forces the next matching subtask execution to fail terminally
pub const EXECUTOR_RUN_ERR: &str = "executor.run_err";

/// Forces a transient (retryable) failure of the next matching execution
pub const EXECUTOR_RUN_RETRYABLE_ERR: &str = "executor.run_retryable_err";

/// Injects an external cancellation signal during the next matching
/// subtask execution
pub const EXECUTOR_RUN_CANCEL: &str = "executor.run_cancel";

struct ArmedPoint {
    point: String,
    /// Restrict firing to one task key; `None` matches any task
    scope: Option<String>,
    /// One-shot counter; the point disarms at zero
    remaining: u32,
}

/// Set of armed injection points, shared with every agent of a runtime
#[derive(Default)]
pub struct FaultHooks {
    armed: Mutex<Vec<ArmedPoint>>,
}

impl FaultHooks {
    /// Create an empty (fully inert) hook set
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `point` for `shots` firings, optionally scoped to a task key
    pub fn arm(&self, point: &str, scope: Option<&str>, shots: u32) {
        let mut armed = self.armed.lock();
        armed.push(ArmedPoint {
            point: point.to_string(),
            scope: scope.map(|s| s.to_string()),
            remaining: shots,
        });
    }

    /// Consume one shot of `point` for the given task key. Returns true
    /// exactly as many times as shots were armed.
    pub fn hit(&self, point: &str, task_key: &str) -> bool {
        let mut armed = self.armed.lock();
        for entry in armed.iter_mut() {
            if entry.point != point || entry.remaining == 0 {
                continue;
            }
            if let Some(scope) = &entry.scope {
                if scope != task_key {
                    continue;
                }
            }
            entry.remaining -= 1;
            return true;
        }
        false
    }

    /// Disarm every point
    pub fn disarm_all(&self) {
        self.armed.lock().clear();
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unarmed_point_never_fires() {
        let hooks = FaultHooks::new();
        assert!(!hooks.hit(EXECUTOR_RUN_ERR, "key1"));
    }

    #[test]
    fn test_one_shot_semantics() {
        let hooks = FaultHooks::new();
        hooks.arm(EXECUTOR_RUN_ERR, None, 1);
        assert!(hooks.hit(EXECUTOR_RUN_ERR, "key1"));
        assert!(!hooks.hit(EXECUTOR_RUN_ERR, "key1"));
    }

    #[test]
    fn test_multi_shot() {
        let hooks = FaultHooks::new();
        hooks.arm(EXECUTOR_RUN_RETRYABLE_ERR, None, 2);
        assert!(hooks.hit(EXECUTOR_RUN_RETRYABLE_ERR, "a"));
        assert!(hooks.hit(EXECUTOR_RUN_RETRYABLE_ERR, "b"));
        assert!(!hooks.hit(EXECUTOR_RUN_RETRYABLE_ERR, "c"));
    }

    #[test]
    fn test_scoped_point_ignores_other_tasks() {
        let hooks = FaultHooks::new();
        hooks.arm(EXECUTOR_RUN_ERR, Some("key0"), 1);
        assert!(!hooks.hit(EXECUTOR_RUN_ERR, "key1"));
        assert!(hooks.hit(EXECUTOR_RUN_ERR, "key0"));
        assert!(!hooks.hit(EXECUTOR_RUN_ERR, "key0"));
    }

    #[test]
    fn test_disarm_all() {
        let hooks = FaultHooks::new();
        hooks.arm(EXECUTOR_RUN_ERR, None, 5);
        hooks.disarm_all();
        assert!(!hooks.hit(EXECUTOR_RUN_ERR, "key1"));
    }

    #[test]
    fn test_points_are_independent() {
        let hooks = FaultHooks::new();
        hooks.arm(EXECUTOR_RUN_ERR, None, 1);
        assert!(!hooks.hit(EXECUTOR_RUN_CANCEL, "key1"));
        assert!(hooks.hit(EXECUTOR_RUN_ERR, "key1"));
    }
}
