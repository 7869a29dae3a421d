//! Task records and partial updates.
//!
//! A [`Task`] is one node of the hierarchical list. Parent/child structure is
//! expressed only through `parent_id`; the child lists used for traversal are
//! derived by [`crate::tree::TaskTree`] and never stored on the record.

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Opaque, collision-free task identifier.
pub type TaskId = String;

/// Generate a fresh task identifier (UUID v4, hyphenated).
pub fn new_task_id() -> TaskId {
    Uuid::new_v4().to_string()
}

/// One persisted task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    /// `None` means top-level.
    #[serde(default)]
    pub parent_id: Option<TaskId>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub is_done: bool,
    /// Position among siblings sharing the same `parent_id`.
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub weight: Option<i64>,
}

impl Task {
    /// Create a top-level, not-done task at order 0.
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            title: title.into(),
            is_done: false,
            order: 0,
            description: None,
            weight: None,
        }
    }

    /// Builder: attach to a parent.
    pub fn with_parent(mut self, parent_id: impl Into<TaskId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Builder: desired sibling position.
    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    /// Builder: completion flag.
    pub fn done(mut self, is_done: bool) -> Self {
        self.is_done = is_done;
        self
    }

    pub fn is_top_level(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Apply a partial update using the reducer policy: a field is applied
    /// only when it is present *and* truthy.
    ///
    /// `is_done: Some(false)`, `order: Some(0)`, empty strings and `null`s are
    /// indistinguishable from an omitted field under this policy.
    pub fn merge_truthy(&mut self, patch: &PartialTask) {
        if let Some(title) = patch.title.as_deref().filter(|t| !t.is_empty()) {
            self.title = title.to_string();
        }
        if let Some(Some(description)) = &patch.description {
            if !description.is_empty() {
                self.description = Some(description.clone());
            }
        }
        if let Some(Some(parent_id)) = &patch.parent_id {
            if !parent_id.is_empty() {
                self.parent_id = Some(parent_id.clone());
            }
        }
        if let Some(order) = patch.order.filter(|o| *o != 0) {
            self.order = order;
        }
        if patch.is_done == Some(true) {
            self.is_done = true;
        }
        if let Some(Some(weight)) = patch.weight {
            if weight != 0 {
                self.weight = Some(weight);
            }
        }
    }

    /// Apply every field present in `patch`, including `false`, `0` and
    /// explicit `null`s. This is how the persistence tier merges updates.
    pub fn merge_exact(&mut self, patch: &PartialTask) {
        if let Some(parent_id) = &patch.parent_id {
            self.parent_id = parent_id.clone();
        }
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(is_done) = patch.is_done {
            self.is_done = is_done;
        }
        if let Some(order) = patch.order {
            self.order = order;
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(weight) = patch.weight {
            self.weight = weight;
        }
    }
}

/// A task identified by `id` with any subset of its scalar fields.
///
/// Nullable fields use `Option<Option<_>>`: the outer `None` means "not
/// supplied", `Some(None)` means "explicitly cleared" (`null` on the wire).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialTask {
    pub id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub parent_id: Option<Option<TaskId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub weight: Option<Option<i64>>,
}

impl PartialTask {
    /// An update carrying only the id.
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn is_done(mut self, is_done: bool) -> Self {
        self.is_done = Some(is_done);
        self
    }

    pub fn order(mut self, order: u32) -> Self {
        self.order = Some(order);
        self
    }

    pub fn parent_id(mut self, parent_id: Option<TaskId>) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn description(mut self, description: Option<String>) -> Self {
        self.description = Some(description);
        self
    }

    pub fn weight(mut self, weight: Option<i64>) -> Self {
        self.weight = Some(weight);
        self
    }

    /// True when no field besides `id` is supplied.
    pub fn is_empty(&self) -> bool {
        self.parent_id.is_none()
            && self.title.is_none()
            && self.is_done.is_none()
            && self.order.is_none()
            && self.description.is_none()
            && self.weight.is_none()
    }
}

/// A present JSON `null` deserializes to `Some(None)` instead of `None`.
fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// A task together with a nested subtree, as carried by a batch ADD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    #[serde(flatten)]
    pub task: Task,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskNode>,
}

impl TaskNode {
    pub fn leaf(task: Task) -> Self {
        Self {
            task,
            children: Vec::new(),
        }
    }

    pub fn with_children(task: Task, children: Vec<TaskNode>) -> Self {
        Self { task, children }
    }

    /// Flatten the subtree depth-first, forcing each descendant's
    /// `parent_id` to its enclosing node. The root keeps its own parent.
    pub fn flatten(self) -> Vec<Task> {
        let mut out = Vec::new();
        Self::flatten_into(self, &mut out);
        out
    }

    fn flatten_into(node: TaskNode, out: &mut Vec<Task>) {
        let parent = node.task.id.clone();
        out.push(node.task);
        for mut child in node.children {
            child.task.parent_id = Some(parent.clone());
            Self::flatten_into(child, out);
        }
    }
}

impl From<Task> for TaskNode {
    fn from(task: Task) -> Self {
        Self::leaf(task)
    }
}
