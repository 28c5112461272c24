//! Dispatch manager
//!
//! Watches the store for tasks that need an owner (freshly submitted,
//! resumed, or orphaned by an owner that died mid-flight) and spawns
//! one dispatcher control loop per task.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::poll::StoreBackoff;
use crate::proto::TaskState;
use crate::registry::ExtensionRegistry;
use crate::storage::TaskStore;

/// Spawns and tracks dispatcher loops
pub struct DispatchManager {
    store: Arc<dyn TaskStore>,
    registry: Arc<ExtensionRegistry>,
    config: DispatchConfig,
    nodes: Vec<String>,
    shutdown: watch::Receiver<bool>,
}

impl DispatchManager {
    /// Create a manager over the given node pool
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<ExtensionRegistry>,
        config: DispatchConfig,
        nodes: Vec<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            nodes,
            shutdown,
        }
    }

    /// Run until shutdown is signalled
    pub async fn run(self) {
        info!(nodes = self.nodes.len(), "Dispatch manager started");
        let mut active: HashMap<i64, JoinHandle<()>> = HashMap::new();
        let mut backoff = StoreBackoff::new(self.config.max_backoff);

        // Running/Cancelling/Reverting pickup covers tasks resumed from
        // pause and tasks whose previous dispatcher died mid-flight.
        let claimable = [
            TaskState::Pending,
            TaskState::Running,
            TaskState::Cancelling,
            TaskState::Reverting,
        ];

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            active.retain(|_, handle| !handle.is_finished());

            let tasks = match self.store.tasks_in_states(&claimable).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(error = %e, "Store poll failed, backing off");
                    backoff.sleep().await;
                    continue;
                }
            };
            backoff.reset();

            for task in tasks {
                if active.contains_key(&task.id) {
                    continue;
                }
                if !self.registry.is_registered(&task.task_type) {
                    debug!(task_id = task.id, task_type = %task.task_type,
                           "Skipping task of unregistered type");
                    continue;
                }

                debug!(task_id = task.id, key = %task.key, state = %task.state,
                       "Spawning dispatcher");
                let dispatcher = Dispatcher::new(
                    self.store.clone(),
                    self.registry.clone(),
                    self.config.clone(),
                    self.nodes.clone(),
                    task.id,
                    self.shutdown.clone(),
                );
                active.insert(task.id, tokio::spawn(dispatcher.run()));
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        for (_, handle) in active {
            let _ = handle.await;
        }
        info!("Dispatch manager stopped");
    }
}
