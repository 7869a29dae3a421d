//! The Diff Engine: minimal changesets between two snapshots.
//!
//! Only the flat records are compared; the derived child index is ignored
//! and no cascade is re-derived. The compared field set is fixed:
//! `parentId`, `title`, `isDone`, `order`, `description`, `weight`.

use serde::{Deserialize, Serialize};

use crate::task::{PartialTask, Task, TaskId};
use crate::tree::TaskTree;

/// Created / removed / updated records, as sent in a `save-changes` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    #[serde(rename = "newTodos", default)]
    pub created: Vec<Task>,
    #[serde(rename = "removeTodos", default)]
    pub removed: Vec<TaskId>,
    #[serde(rename = "updateTodos", default)]
    pub updated: Vec<PartialTask>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    /// Total number of entries across the three lists.
    pub fn len(&self) -> usize {
        self.created.len() + self.removed.len() + self.updated.len()
    }

    /// Apply to `base`: add created, drop removed, merge updated fields.
    ///
    /// Updates use [`Task::merge_exact`]; an update for an id that is not in
    /// `base` is ignored.
    pub fn apply_to(&self, base: &TaskTree) -> TaskTree {
        let mut records = base.records().clone();
        for id in &self.removed {
            records.remove(id);
        }
        for task in &self.created {
            records.insert(task.id.clone(), task.clone());
        }
        for patch in &self.updated {
            if let Some(task) = records.get_mut(&patch.id) {
                task.merge_exact(patch);
            }
        }
        TaskTree::from_tasks(records.into_values())
    }
}

/// Compute the changeset from `previous` to `current`.
///
/// Returns `None` when nothing differs.
pub fn diff(previous: &TaskTree, current: &TaskTree) -> Option<Changeset> {
    let prev = previous.records();
    let next = current.records();

    let created = next
        .iter()
        .filter(|(id, _)| !prev.contains_key(*id))
        .map(|(_, task)| task.clone())
        .collect();
    let removed = prev
        .keys()
        .filter(|id| !next.contains_key(*id))
        .cloned()
        .collect();
    let updated = next
        .iter()
        .filter_map(|(id, task)| prev.get(id).and_then(|old| field_delta(old, task)))
        .collect();

    let changes = Changeset {
        created,
        removed,
        updated,
    };
    (!changes.is_empty()).then_some(changes)
}

/// The partial record holding only the fields that differ.
fn field_delta(old: &Task, new: &Task) -> Option<PartialTask> {
    let mut patch = PartialTask::new(new.id.clone());
    if old.parent_id != new.parent_id {
        patch.parent_id = Some(new.parent_id.clone());
    }
    if old.title != new.title {
        patch.title = Some(new.title.clone());
    }
    if old.is_done != new.is_done {
        patch.is_done = Some(new.is_done);
    }
    if old.order != new.order {
        patch.order = Some(new.order);
    }
    if old.description != new.description {
        patch.description = Some(new.description.clone());
    }
    if old.weight != new.weight {
        patch.weight = Some(new.weight);
    }
    (!patch.is_empty()).then_some(patch)
}
