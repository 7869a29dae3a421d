//! List queries: completion filters and title search, applied at every
//! level of the tree.

use crate::task::Task;
use crate::tree::TaskTree;

/// Which tasks a participant's view shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFilter {
    pub show_completed: bool,
    pub show_in_progress: bool,
    /// Case-sensitive substring of the title; empty matches everything.
    pub text: String,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            show_completed: true,
            show_in_progress: true,
            text: String::new(),
        }
    }
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        let by_state = (self.show_completed && task.is_done)
            || (self.show_in_progress && !task.is_done);
        by_state && task.title.contains(&self.text)
    }
}

impl TaskTree {
    /// Top-level tasks passing `filter`, sorted by order.
    pub fn visible_roots(&self, filter: &TaskFilter) -> Vec<&Task> {
        self.roots().into_iter().filter(|t| filter.matches(t)).collect()
    }

    /// Children of `id` passing `filter`, sorted by order.
    ///
    /// A child that fails the filter hides its whole subtree, even if some
    /// descendant would match on its own.
    pub fn visible_children(&self, id: &str, filter: &TaskFilter) -> Vec<&Task> {
        self.child_tasks(id)
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect()
    }
}
