//! taskgrid - Distributed task dispatch and execution framework
//!
//! A control plane that splits a logical job into ordered steps, fans
//! each step's work out across a pool of executor nodes as subtasks,
//! tracks progress through a task store, and guarantees that partial
//! failures trigger deterministic rollback instead of leaving the
//! system inconsistent.
//!
//! The moving parts:
//!
//! - [`storage::TaskStore`] - the single source of truth; all
//!   coordination happens through conditional state transitions.
//! - [`dispatch::Dispatcher`] - owns one task end-to-end: step
//!   sequencing, fan-out, failure detection, rollback, cleanup.
//! - [`scheduler::Scheduler`] - per-(node, task) agent executing
//!   subtasks through a [`scheduler::SubtaskExecutor`].
//! - [`registry::ExtensionRegistry`] - explicit mapping from task type
//!   to the factories producing the pieces above.
//! - [`runtime::Runtime`] - assembles everything into a running node.

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod faultinject;
pub mod logging;
mod poll;
pub mod proto;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod storage;
pub mod version;

pub use error::{Error, ErrorCode, Result};
pub use proto::{NewSubtask, Subtask, SubtaskState, Task, TaskState};
pub use registry::ExtensionRegistry;
pub use runtime::{Runtime, RuntimeConfig};
pub use storage::{MemTaskStore, TaskStore};
