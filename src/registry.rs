//! Extension registry
//!
//! Maps a task type to the factories that produce its dispatcher
//! planning extension, scheduler extension and cleanup routine. The
//! registry is an explicit object handed to the runtime and its agents,
//! not process-global state; tests build one registry per case and
//! production processes build one at startup and never clear it.
//!
//! Re-registration for the same type overwrites the prior binding. The
//! `clear_*` operations exist for test isolation only.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::dispatch::{CleanupRoutine, DispatcherExtension};
use crate::error::{Error, Result};
use crate::proto::Task;
use crate::scheduler::SchedulerExtension;

/// Produces the dispatcher planning extension for one task
pub type DispatcherFactory = Arc<dyn Fn(&Task) -> Arc<dyn DispatcherExtension> + Send + Sync>;

/// Produces the scheduler extension for one (node, task) pair
pub type SchedulerFactory = Arc<dyn Fn(&Task) -> Arc<dyn SchedulerExtension> + Send + Sync>;

/// Produces the cleanup routine invoked after terminal commit
pub type CleanupFactory = Arc<dyn Fn() -> Arc<dyn CleanupRoutine> + Send + Sync>;

#[derive(Default)]
struct Binding {
    dispatcher: Option<DispatcherFactory>,
    scheduler: Option<SchedulerFactory>,
    cleanup: Option<CleanupFactory>,
}

/// Process-wide task-type bindings, held explicitly
#[derive(Default)]
pub struct ExtensionRegistry {
    bindings: RwLock<HashMap<String, Binding>>,
}

impl ExtensionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────

    /// Register the dispatcher factory for a task type, overwriting any
    /// prior registration
    pub fn register_dispatcher(&self, task_type: &str, factory: DispatcherFactory) {
        let mut bindings = self.bindings.write();
        bindings.entry(task_type.to_string()).or_default().dispatcher = Some(factory);
        tracing::debug!(task_type, "Dispatcher factory registered");
    }

    /// Register the scheduler factory for a task type
    pub fn register_scheduler(&self, task_type: &str, factory: SchedulerFactory) {
        let mut bindings = self.bindings.write();
        bindings.entry(task_type.to_string()).or_default().scheduler = Some(factory);
        tracing::debug!(task_type, "Scheduler factory registered");
    }

    /// Register the cleanup factory for a task type
    pub fn register_cleanup(&self, task_type: &str, factory: CleanupFactory) {
        let mut bindings = self.bindings.write();
        bindings.entry(task_type.to_string()).or_default().cleanup = Some(factory);
        tracing::debug!(task_type, "Cleanup factory registered");
    }

    // ─────────────────────────────────────────────────────────────
    // Test-isolation clearing
    // ─────────────────────────────────────────────────────────────

    /// Remove the dispatcher factory for a task type
    pub fn clear_dispatcher(&self, task_type: &str) {
        if let Some(binding) = self.bindings.write().get_mut(task_type) {
            binding.dispatcher = None;
        }
    }

    /// Remove the scheduler factory for a task type
    pub fn clear_scheduler(&self, task_type: &str) {
        if let Some(binding) = self.bindings.write().get_mut(task_type) {
            binding.scheduler = None;
        }
    }

    /// Remove the cleanup factory for a task type
    pub fn clear_cleanup(&self, task_type: &str) {
        if let Some(binding) = self.bindings.write().get_mut(task_type) {
            binding.cleanup = None;
        }
    }

    /// Remove every binding
    pub fn clear_all(&self) {
        self.bindings.write().clear();
    }

    // ─────────────────────────────────────────────────────────────
    // Lookup
    // ─────────────────────────────────────────────────────────────

    /// Whether the type has a complete binding (all three factories)
    pub fn is_registered(&self, task_type: &str) -> bool {
        self.bindings
            .read()
            .get(task_type)
            .map(|b| b.dispatcher.is_some() && b.scheduler.is_some() && b.cleanup.is_some())
            .unwrap_or(false)
    }

    /// Registered task types with complete bindings
    pub fn registered_types(&self) -> Vec<String> {
        self.bindings
            .read()
            .iter()
            .filter(|(_, b)| b.dispatcher.is_some() && b.scheduler.is_some() && b.cleanup.is_some())
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Build the dispatcher extension for a task
    pub fn dispatcher_ext(&self, task: &Task) -> Result<Arc<dyn DispatcherExtension>> {
        let bindings = self.bindings.read();
        let factory = bindings
            .get(&task.task_type)
            .and_then(|b| b.dispatcher.as_ref())
            .ok_or_else(|| Error::TypeNotRegistered(task.task_type.clone()))?;
        Ok(factory(task))
    }

    /// Build the scheduler extension for a task
    pub fn scheduler_ext(&self, task: &Task) -> Result<Arc<dyn SchedulerExtension>> {
        let bindings = self.bindings.read();
        let factory = bindings
            .get(&task.task_type)
            .and_then(|b| b.scheduler.as_ref())
            .ok_or_else(|| Error::TypeNotRegistered(task.task_type.clone()))?;
        Ok(factory(task))
    }

    /// Build the cleanup routine for a task type
    pub fn cleanup_routine(&self, task_type: &str) -> Result<Arc<dyn CleanupRoutine>> {
        let bindings = self.bindings.read();
        let factory = bindings
            .get(task_type)
            .and_then(|b| b.cleanup.as_ref())
            .ok_or_else(|| Error::TypeNotRegistered(task_type.to_string()))?;
        Ok(factory())
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
