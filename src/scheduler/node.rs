//! Node agent
//!
//! One agent per executor node. It watches the store for running tasks
//! of registered types that have work assigned to its node and maintains
//! one scheduler per (node, task) pair for the task's lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::faultinject::FaultHooks;
use crate::poll::StoreBackoff;
use crate::proto::TaskState;
use crate::registry::ExtensionRegistry;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::storage::TaskStore;

/// Watches for eligible work and spawns schedulers on one node
pub struct NodeAgent {
    store: Arc<dyn TaskStore>,
    registry: Arc<ExtensionRegistry>,
    hooks: Arc<FaultHooks>,
    config: SchedulerConfig,
    node: String,
    shutdown: watch::Receiver<bool>,
}

impl NodeAgent {
    /// Create an agent for one node id
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<ExtensionRegistry>,
        hooks: Arc<FaultHooks>,
        config: SchedulerConfig,
        node: String,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            registry,
            hooks,
            config,
            node,
            shutdown,
        }
    }

    /// Run until shutdown is signalled
    pub async fn run(self) {
        info!(node = %self.node, "Node agent started");
        let mut active: HashMap<i64, JoinHandle<()>> = HashMap::new();
        let mut backoff = StoreBackoff::new(self.config.max_backoff);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            active.retain(|_, handle| !handle.is_finished());

            let tasks = match self.store.tasks_in_states(&[TaskState::Running]).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(node = %self.node, error = %e, "Store poll failed, backing off");
                    backoff.sleep().await;
                    continue;
                }
            };
            backoff.reset();

            for task in tasks {
                if active.contains_key(&task.id) || !self.registry.is_registered(&task.task_type) {
                    continue;
                }

                // Participate only once this node actually has work.
                let has_work = match self.store.claimable_subtasks(task.id, &self.node).await {
                    Ok(subtasks) => !subtasks.is_empty(),
                    Err(e) => {
                        warn!(node = %self.node, task_id = task.id, error = %e,
                              "Failed to query claimable subtasks");
                        false
                    }
                };
                if !has_work {
                    continue;
                }

                let ext = match self.registry.scheduler_ext(&task) {
                    Ok(ext) => ext,
                    Err(e) => {
                        warn!(node = %self.node, task_id = task.id, error = %e,
                              "No scheduler extension");
                        continue;
                    }
                };

                debug!(node = %self.node, task_id = task.id, task_type = %task.task_type,
                       "Spawning scheduler");
                let scheduler = Scheduler::new(
                    self.store.clone(),
                    ext,
                    self.hooks.clone(),
                    self.config.clone(),
                    self.node.clone(),
                    task.id,
                    self.shutdown.clone(),
                );
                active.insert(task.id, tokio::spawn(scheduler.run()));
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        for (_, handle) in active {
            let _ = handle.await;
        }
        info!(node = %self.node, "Node agent stopped");
    }
}
