//! Pure tree walks used by the transitions.
//!
//! Each function takes a snapshot by value and returns the next one, so
//! transitions are written as a pipeline of walks. None of them fail: an id
//! that is not present is skipped.

use super::TaskTree;
use crate::task::TaskId;

/// Derive `is_done` of `id` from its direct children.
///
/// A task without children keeps its own (authoritative) flag.
pub fn reevaluate(mut tree: TaskTree, id: &str) -> TaskTree {
    let children = tree.children(id);
    if children.is_empty() {
        return tree;
    }
    let all_done = children
        .iter()
        .filter_map(|c| tree.tasks.get(c))
        .all(|c| c.is_done);
    if let Some(task) = tree.tasks.get_mut(id) {
        task.is_done = all_done;
    }
    tree
}

/// Re-evaluate every ancestor of `id`, nearest first, up to the root.
pub fn propagate_up(tree: TaskTree, id: &str) -> TaskTree {
    tree.ancestors(id)
        .into_iter()
        .fold(tree, |tree, ancestor| reevaluate(tree, &ancestor))
}

/// Push the completion flag of `id` down to all descendants, then
/// re-evaluate upward from every leaf reached.
pub fn propagate_down(mut tree: TaskTree, id: &str) -> TaskTree {
    let Some(value) = tree.tasks.get(id).map(|t| t.is_done) else {
        return tree;
    };
    let descendants = tree.descendants(id);
    for descendant in &descendants {
        if let Some(task) = tree.tasks.get_mut(descendant) {
            task.is_done = value;
        }
    }
    let leaves: Vec<TaskId> = descendants
        .into_iter()
        .filter(|d| !tree.has_children(d))
        .collect();
    leaves
        .iter()
        .fold(tree, |tree, leaf| propagate_up(tree, leaf))
}

/// Place `id` at index `desired` among the tasks sharing `parent`.
///
/// Siblings are sorted by their current order; those before the slot keep
/// their index, the rest move up by one. `desired` is clamped to the group
/// size so the group stays gap-free.
pub fn rebalance_siblings(
    mut tree: TaskTree,
    parent: Option<&str>,
    id: &str,
    desired: u32,
) -> TaskTree {
    let group = sorted_group(&tree, parent, Some(id));
    let slot = (desired as usize).min(group.len());
    for (index, sibling) in group.iter().enumerate() {
        let order = if index < slot { index } else { index + 1 };
        if let Some(task) = tree.tasks.get_mut(sibling) {
            task.order = order as u32;
        }
    }
    if let Some(task) = tree.tasks.get_mut(id) {
        task.order = slot as u32;
    }
    tree
}

/// Reassign a dense 0..n-1 order to the tasks sharing `parent`.
pub fn compact_siblings(mut tree: TaskTree, parent: Option<&str>) -> TaskTree {
    for (index, sibling) in sorted_group(&tree, parent, None).iter().enumerate() {
        if let Some(task) = tree.tasks.get_mut(sibling) {
            task.order = index as u32;
        }
    }
    tree
}

fn sorted_group(tree: &TaskTree, parent: Option<&str>, exclude: Option<&str>) -> Vec<TaskId> {
    tree.siblings(parent)
        .into_iter()
        .filter(|t| Some(t.id.as_str()) != exclude)
        .map(|t| t.id.clone())
        .collect()
}
