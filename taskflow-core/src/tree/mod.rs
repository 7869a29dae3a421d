//! The Tree Store: an immutable arena of tasks plus a derived child index.
//!
//! ```text
//!   tasks (authoritative)            children (derived)
//! ┌──────┬──────────────────┐      ┌──────┬───────────┐
//! │ "1"  │ Task {parent: -} │      │ "1"  │ ["3"]     │
//! │ "2"  │ Task {parent: -} │ ───► │ "2"  │ ["4","6"] │
//! │ "3"  │ Task {parent: 1} │      └──────┴───────────┘
//! │ ...  │                  │
//! └──────┴──────────────────┘
//! ```
//!
//! Every transition goes through [`TaskTree::apply`], which clones the
//! snapshot and threads it through the pure walks in [`cascade`]. Old
//! snapshots stay valid for readers and for the diff engine.

pub mod cascade;

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::action::Action;
use crate::error::TreeError;
use crate::task::{PartialTask, Task, TaskId, TaskNode};

/// Immutable snapshot of the task list.
#[derive(Debug, Clone, Default)]
pub struct TaskTree {
    tasks: BTreeMap<TaskId, Task>,
    children: HashMap<TaskId, Vec<TaskId>>,
}

impl TaskTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tree from a flat list in one pass.
    ///
    /// Sibling groups come out sorted by `order`. Tasks whose parent is not
    /// in the list are kept in the arena but left out of the child index.
    pub fn from_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let mut map = BTreeMap::new();
        for task in tasks {
            if let Some(previous) = map.insert(task.id.clone(), task) {
                log::warn!("Duplicate task {} in load, keeping the last record", previous.id);
            }
        }

        let mut sorted: Vec<&Task> = map.values().collect();
        sorted.sort_by_key(|t| t.order);

        let mut children: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for task in sorted {
            let Some(parent_id) = &task.parent_id else {
                continue;
            };
            if map.contains_key(parent_id) {
                children
                    .entry(parent_id.clone())
                    .or_default()
                    .push(task.id.clone());
            } else {
                log::warn!("Task {} references missing parent {parent_id}", task.id);
            }
        }

        Self { tasks: map, children }
    }

    /// The pure state-transition function.
    pub fn apply(&self, action: Action) -> Result<TaskTree, TreeError> {
        let tree = self.clone();
        match action {
            Action::Add(node) => tree.add(node),
            Action::Remove(id) => tree.remove(&id),
            Action::Check(id) => tree.check(&id),
            Action::Update(patch) => tree.update(&patch),
        }
    }

    // ─── Transitions ──────────────────────────────────────────────────

    fn add(mut self, node: TaskNode) -> Result<TaskTree, TreeError> {
        let id = node.task.id.clone();
        let parent_id = node.task.parent_id.clone();
        let desired = node.task.order;
        let has_subtree = !node.children.is_empty();

        let flat = node.flatten();
        let mut seen = HashSet::new();
        if let Some(existing) = flat
            .iter()
            .find(|t| self.tasks.contains_key(&t.id) || !seen.insert(t.id.as_str()))
        {
            return Err(TreeError::DuplicateTask(existing.id.clone()));
        }

        let parent_resolved = match &parent_id {
            Some(p) if !self.tasks.contains_key(p) => {
                log::warn!("Task {id} added under missing parent {p}; left detached");
                false
            }
            Some(_) => true,
            None => false,
        };

        let mut flat = flat.into_iter();
        if let Some(root) = flat.next() {
            self.tasks.insert(root.id.clone(), root);
        }
        if parent_id.is_none() || parent_resolved {
            self = cascade::rebalance_siblings(self, parent_id.as_deref(), &id, desired);
        }
        if let (Some(p), true) = (&parent_id, parent_resolved) {
            self.children.entry(p.clone()).or_default().insert(0, id.clone());
        }
        let mut groups: Vec<TaskId> = Vec::new();
        for task in flat {
            if let Some(p) = &task.parent_id {
                self.children.entry(p.clone()).or_default().push(task.id.clone());
                if !groups.contains(p) {
                    groups.push(p.clone());
                }
            }
            self.tasks.insert(task.id.clone(), task);
        }
        for parent in &groups {
            self = cascade::compact_siblings(self, Some(parent));
            self.sort_child_index(parent);
        }
        self.adopt_orphans(&id);

        if has_subtree {
            self = cascade::propagate_down(self, &id);
        }
        if parent_resolved {
            self = cascade::propagate_up(self, &id);
        }
        Ok(self)
    }

    fn remove(mut self, id: &str) -> Result<TaskTree, TreeError> {
        let task = self
            .tasks
            .remove(id)
            .ok_or_else(|| TreeError::TaskNotFound(id.to_string()))?;

        // Depth-first subtree removal before the node's own index entry goes.
        for descendant in self.descendants(id) {
            self.tasks.remove(&descendant);
            self.children.remove(&descendant);
        }
        self.children.remove(id);
        if let Some(parent_id) = &task.parent_id {
            self.detach(parent_id, id);
        }

        self = cascade::compact_siblings(self, task.parent_id.as_deref());
        if let Some(parent_id) = &task.parent_id {
            if self.tasks.contains_key(parent_id) {
                self = cascade::reevaluate(self, parent_id);
                self = cascade::propagate_up(self, parent_id);
            }
        }
        Ok(self)
    }

    fn check(mut self, id: &str) -> Result<TaskTree, TreeError> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| TreeError::TaskNotFound(id.to_string()))?;
        task.is_done = !task.is_done;

        if self.has_children(id) {
            self = cascade::propagate_down(self, id);
        }
        Ok(cascade::propagate_up(self, id))
    }

    fn update(mut self, patch: &PartialTask) -> Result<TaskTree, TreeError> {
        let current = self
            .tasks
            .get(&patch.id)
            .ok_or_else(|| TreeError::TaskNotFound(patch.id.clone()))?;

        let mut updated = current.clone();
        updated.merge_truthy(patch);

        if updated.parent_id != current.parent_id {
            if let Some(new_parent) = &updated.parent_id {
                if *new_parent == patch.id || self.descendants(&patch.id).contains(new_parent) {
                    return Err(TreeError::InvalidParent {
                        id: patch.id.clone(),
                        parent_id: new_parent.clone(),
                    });
                }
            }
            if let Some(old_parent) = current.parent_id.clone() {
                self.detach(&old_parent, &patch.id);
            }
            if let Some(new_parent) = &updated.parent_id {
                if self.tasks.contains_key(new_parent) {
                    self.children
                        .entry(new_parent.clone())
                        .or_default()
                        .insert(0, patch.id.clone());
                }
            }
        }

        self.tasks.insert(patch.id.clone(), updated);
        Ok(self)
    }

    /// Remove `child` from `parent`'s derived list, dropping empty lists.
    fn detach(&mut self, parent: &str, child: &str) {
        if let Some(list) = self.children.get_mut(parent) {
            list.retain(|c| c != child);
            if list.is_empty() {
                self.children.remove(parent);
            }
        }
    }

    /// Link tasks that were loaded or added before `id` existed.
    fn sort_child_index(&mut self, parent: &str) {
        let Some(mut list) = self.children.remove(parent) else {
            return;
        };
        list.sort_by_key(|c| self.tasks.get(c).map(|t| t.order));
        self.children.insert(parent.to_string(), list);
    }

    fn adopt_orphans(&mut self, id: &str) {
        let linked: HashSet<&TaskId> = self
            .children
            .get(id)
            .map(|list| list.iter().collect())
            .unwrap_or_default();
        let mut orphans: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.parent_id.as_deref() == Some(id) && !linked.contains(&t.id))
            .collect();
        if orphans.is_empty() {
            return;
        }
        orphans.sort_by_key(|t| t.order);
        let orphans: Vec<TaskId> = orphans.into_iter().map(|t| t.id.clone()).collect();
        self.children.entry(id.to_string()).or_default().extend(orphans);
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// All records in id order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// The flat id → task mapping.
    pub fn records(&self) -> &BTreeMap<TaskId, Task> {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks.into_values().collect()
    }

    /// Derived child ids, in index order (newly added children first).
    pub fn children(&self, id: &str) -> &[TaskId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_children(&self, id: &str) -> bool {
        !self.children(id).is_empty()
    }

    /// Child records sorted by `order`.
    pub fn child_tasks(&self, id: &str) -> Vec<&Task> {
        let mut out: Vec<&Task> = self
            .children(id)
            .iter()
            .filter_map(|c| self.tasks.get(c))
            .collect();
        out.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Top-level tasks sorted by `order`.
    pub fn roots(&self) -> Vec<&Task> {
        self.siblings(None)
    }

    /// Every task whose `parent_id` equals `parent`, sorted by `order`.
    pub fn siblings(&self, parent: Option<&str>) -> Vec<&Task> {
        let mut out: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.parent_id.as_deref() == parent)
            .collect();
        out.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Ancestor ids, nearest first. Stops at a missing parent or a cycle.
    pub fn ancestors(&self, id: &str) -> Vec<TaskId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        seen.insert(id.to_string());
        let mut cursor = self.tasks.get(id).and_then(|t| t.parent_id.clone());
        while let Some(parent_id) = cursor {
            if !seen.insert(parent_id.clone()) {
                break;
            }
            let Some(parent) = self.tasks.get(&parent_id) else {
                break;
            };
            cursor = parent.parent_id.clone();
            out.push(parent_id);
        }
        out
    }

    /// Descendant ids in depth-first pre-order, following the child index.
    pub fn descendants(&self, id: &str) -> Vec<TaskId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        seen.insert(id.to_string());
        let mut stack: Vec<&TaskId> = self.children(id).iter().rev().collect();
        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            out.push(next.clone());
            stack.extend(self.children(next).iter().rev());
        }
        out
    }

    /// Tasks whose `parent_id` does not resolve. Tolerated, never fatal.
    pub fn dangling(&self) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|t| matches!(&t.parent_id, Some(p) if !self.tasks.contains_key(p)))
            .collect()
    }

    /// `(done, total)` over top-level tasks.
    pub fn root_summary(&self) -> (usize, usize) {
        let roots = self.roots();
        let done = roots.iter().filter(|t| t.is_done).count();
        (done, roots.len())
    }
}
