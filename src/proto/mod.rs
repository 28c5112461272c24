//! Core data model for the framework
//!
//! Defines tasks, subtasks and their state machines. These records are
//! owned by the task store and mutated only through its state-transition
//! operations.

mod subtask;
mod task;

pub use subtask::*;
pub use task::*;
