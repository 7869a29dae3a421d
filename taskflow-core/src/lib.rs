//! # taskflow-core: hierarchical task state engine
//!
//! Pure, synchronous building blocks shared by every participant:
//!
//! ```text
//!   Action ──► TaskTree::apply ──► TaskTree (new snapshot)
//!                                      │
//!              last persisted ─────────┤
//!                                      ▼
//!                               diff::diff ──► Changeset
//! ```
//!
//! ## Modules
//!
//! - [`task`]: `Task`, `PartialTask`, `TaskNode` records
//! - [`action`]: the four reducer actions (`ADD`, `REMOVE`, `CHECK`, `UPDATE`)
//! - [`tree`]: immutable snapshot, transitions and cascade walks
//! - [`diff`]: minimal created/removed/updated changesets
//! - [`filter`]: top-level list queries

pub mod action;
pub mod diff;
pub mod error;
pub mod filter;
pub mod task;
pub mod tree;

pub use action::Action;
pub use diff::{diff, Changeset};
pub use error::TreeError;
pub use filter::TaskFilter;
pub use task::{new_task_id, PartialTask, Task, TaskId, TaskNode};
pub use tree::TaskTree;
