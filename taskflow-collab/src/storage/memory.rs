//! In-process repository for tests and ephemeral servers.

use std::collections::BTreeMap;
use std::sync::RwLock;

use taskflow_core::{PartialTask, Task, TaskId};

use super::{StoreError, TaskRepository};

/// Records kept in a map; lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<BTreeMap<TaskId, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a fixed set of records.
    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        Self {
            tasks: RwLock::new(tasks.into_iter().map(|t| (t.id.clone(), t)).collect()),
        }
    }

    fn poisoned<T>(_: T) -> StoreError {
        StoreError::DatabaseError("memory store lock poisoned".into())
    }
}

impl TaskRepository for MemoryTaskStore {
    fn list(&self) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read().map_err(Self::poisoned)?;
        Ok(tasks.values().cloned().collect())
    }

    fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let tasks = self.tasks.read().map_err(Self::poisoned)?;
        Ok(tasks.get(id).cloned())
    }

    fn create(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().map_err(Self::poisoned)?;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists(task.id.clone()));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn update(&self, patch: &PartialTask) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().map_err(Self::poisoned)?;
        let task = tasks
            .get_mut(&patch.id)
            .ok_or_else(|| StoreError::NotFound(patch.id.clone()))?;
        task.merge_exact(patch);
        Ok(task.clone())
    }

    fn delete_many(&self, ids: &[TaskId]) -> Result<usize, StoreError> {
        let mut tasks = self.tasks.write().map_err(Self::poisoned)?;
        Ok(ids.iter().filter(|id| tasks.remove(*id).is_some()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_get_list() {
        let store = MemoryTaskStore::new();
        store.create(&Task::new("b", "B")).unwrap();
        store.create(&Task::new("a", "A")).unwrap();

        assert_eq!(store.get("a").unwrap().unwrap().title, "A");
        assert!(store.get("z").unwrap().is_none());
        let ids: Vec<_> = store.list().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let store = MemoryTaskStore::new();
        let err = store.update(&PartialTask::new("x").title("t")).unwrap_err();
        assert_eq!(err, StoreError::NotFound("x".into()));
    }

    #[test]
    fn test_delete_many_counts_only_existing() {
        let store = MemoryTaskStore::with_tasks(vec![Task::new("1", "a"), Task::new("2", "b")]);
        let removed = store
            .delete_many(&["1".to_string(), "9".to_string()])
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
