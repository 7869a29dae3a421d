//! Tree store errors.

use crate::task::TaskId;

/// Structural errors raised by [`crate::tree::TaskTree::apply`].
///
/// These are caller contract violations and are returned rather than
/// swallowed. Dangling parents are *not* errors; see
/// [`crate::tree::TaskTree::dangling`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// CHECK/REMOVE/UPDATE on an id that is not in the snapshot.
    TaskNotFound(TaskId),
    /// ADD with an id that is already in the snapshot.
    DuplicateTask(TaskId),
    /// UPDATE that would make a task its own ancestor.
    InvalidParent { id: TaskId, parent_id: TaskId },
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskNotFound(id) => write!(f, "Task not found: {id}"),
            Self::DuplicateTask(id) => write!(f, "Task already exists: {id}"),
            Self::InvalidParent { id, parent_id } => {
                write!(f, "Task {id} cannot be moved under {parent_id}")
            }
        }
    }
}

impl std::error::Error for TreeError {}
