//! Runtime assembly
//!
//! Bundles a task store, an extension registry and fault hooks, and
//! runs the dispatch manager plus one node agent per configured node.
//! The node binary and the test harness both drive the framework
//! through this type.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::dispatch::{DispatchConfig, DispatchManager};
use crate::error::{Error, Result};
use crate::faultinject::FaultHooks;
use crate::proto::Task;
use crate::registry::ExtensionRegistry;
use crate::scheduler::{NodeAgent, SchedulerConfig};
use crate::storage::TaskStore;

// ─────────────────────────────────────────────────────────────────
// Runtime Configuration
// ─────────────────────────────────────────────────────────────────

/// Assembled configuration for one runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Executor node ids; generated from the host name when empty
    pub nodes: Vec<String>,

    /// Dispatcher loop tuning
    pub dispatch: DispatchConfig,

    /// Scheduler loop tuning
    pub scheduler: SchedulerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            dispatch: DispatchConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Generate a default node pool from the host name
pub fn default_nodes(count: usize) -> Vec<String> {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("host-{}", Uuid::new_v4().as_simple()));
    (1..=count.max(1))
        .map(|i| format!("{host}-executor-{i}"))
        .collect()
}

// ─────────────────────────────────────────────────────────────────
// Runtime
// ─────────────────────────────────────────────────────────────────

/// A running instance of the framework
pub struct Runtime {
    id: Uuid,
    store: Arc<dyn TaskStore>,
    registry: Arc<ExtensionRegistry>,
    hooks: Arc<FaultHooks>,
    config: RuntimeConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Create a runtime over a store and a registry
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<ExtensionRegistry>,
        mut config: RuntimeConfig,
    ) -> Self {
        if config.nodes.is_empty() {
            config.nodes = default_nodes(num_cpus::get().min(4));
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            store,
            registry,
            hooks: Arc::new(FaultHooks::new()),
            config,
            shutdown_tx,
            shutdown_rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Replace the fault hook set; used by the test harness before
    /// `start`
    pub fn with_fault_hooks(mut self, hooks: Arc<FaultHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The store this runtime coordinates through
    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    /// The registry of task-type bindings
    pub fn registry(&self) -> Arc<ExtensionRegistry> {
        self.registry.clone()
    }

    /// The fault hooks shared with every agent
    pub fn fault_hooks(&self) -> Arc<FaultHooks> {
        self.hooks.clone()
    }

    /// Configured node ids
    pub fn nodes(&self) -> &[String] {
        &self.config.nodes
    }

    /// Spawn the dispatch manager and one agent per node
    pub fn start(&self) {
        info!(runtime_id = %self.id, nodes = self.config.nodes.len(), "Runtime starting");
        let mut handles = self.handles.lock();

        let manager = DispatchManager::new(
            self.store.clone(),
            self.registry.clone(),
            self.config.dispatch.clone(),
            self.config.nodes.clone(),
            self.shutdown_rx.clone(),
        );
        handles.push(tokio::spawn(manager.run()));

        for node in &self.config.nodes {
            let agent = NodeAgent::new(
                self.store.clone(),
                self.registry.clone(),
                self.hooks.clone(),
                self.config.scheduler.clone(),
                node.clone(),
                self.shutdown_rx.clone(),
            );
            handles.push(tokio::spawn(agent.run()));
        }
    }

    /// Signal every loop to stop and wait for them
    pub async fn shutdown(&self) {
        debug!(runtime_id = %self.id, "Runtime shutting down");
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        info!(runtime_id = %self.id, "Runtime stopped");
    }

    // ─────────────────────────────────────────────────────────────
    // Task Operations
    // ─────────────────────────────────────────────────────────────

    /// Submit a task; dispatch begins on the manager's next poll
    pub async fn submit_task(
        &self,
        key: &str,
        task_type: &str,
        concurrency: u32,
        meta: serde_json::Value,
    ) -> Result<i64> {
        if !self.registry.is_registered(task_type) {
            return Err(Error::TypeNotRegistered(task_type.to_string()));
        }
        let id = self.store.create_task(key, task_type, concurrency, meta).await?;
        info!(task_id = id, key, task_type, "Task submitted");
        Ok(id)
    }

    /// Request cancellation of a live task by key
    pub async fn cancel_task(&self, key: &str) -> Result<bool> {
        match self.store.task_by_key(key).await? {
            Some(task) => self.store.request_cancel(task.id).await,
            None => Ok(false),
        }
    }

    /// Request pause of a running task by key
    pub async fn pause_task(&self, key: &str) -> Result<bool> {
        match self.store.task_by_key(key).await? {
            Some(task) => self.store.request_pause(task.id).await,
            None => Ok(false),
        }
    }

    /// Resume a paused task by key
    pub async fn resume_task(&self, key: &str) -> Result<bool> {
        match self.store.task_by_key(key).await? {
            Some(task) => self.store.resume_task(task.id).await,
            None => Ok(false),
        }
    }

    /// Poll until the task leaves every active state, or time out.
    /// Transient store errors are absorbed by the poll loop.
    pub async fn wait_task_exit(&self, key: &str, timeout: Duration) -> Result<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.store.task_history_by_key(key).await {
                Ok(Some(task)) if !task.state.is_active() => return Ok(task),
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    debug!(key, error = %e, "Store poll failed while waiting, retrying");
                }
                Err(e) => return Err(e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Internal(format!(
                    "timed out waiting for task '{key}' to exit"
                )));
            }
            tokio::time::sleep(self.config.dispatch.poll_interval).await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemTaskStore;

    #[test]
    fn test_default_nodes_are_distinct() {
        let nodes = default_nodes(3);
        assert_eq!(nodes.len(), 3);
        assert_ne!(nodes[0], nodes[1]);
    }

    #[test]
    fn test_default_nodes_minimum_one() {
        assert_eq!(default_nodes(0).len(), 1);
    }

    #[tokio::test]
    async fn test_submit_requires_registered_type() {
        let runtime = Runtime::new(
            Arc::new(MemTaskStore::new()),
            Arc::new(ExtensionRegistry::new()),
            RuntimeConfig::default(),
        );
        let err = runtime
            .submit_task("key1", "unregistered", 1, serde_json::Value::Null)
            .await;
        assert!(matches!(err, Err(Error::TypeNotRegistered(_))));
    }

    #[tokio::test]
    async fn test_cancel_unknown_key() {
        let runtime = Runtime::new(
            Arc::new(MemTaskStore::new()),
            Arc::new(ExtensionRegistry::new()),
            RuntimeConfig::default(),
        );
        assert!(!runtime.cancel_task("missing").await.unwrap());
    }
}
