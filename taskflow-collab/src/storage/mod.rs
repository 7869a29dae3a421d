//! Persistence tier for task records.
//!
//! ```text
//! ┌─────────────┐  save-changes   ┌──────────────────┐
//! │ SyncServer  │ ──────────────► │ apply_changeset  │
//! └──────┬──────┘                 └────────┬─────────┘
//!        │ GET /todos                      │ per-item create/update,
//!        ▼                                 ▼ one bulk delete
//! ┌──────────────────────────────────────────────────┐
//! │ dyn TaskRepository                               │
//! │   MemoryTaskStore │ RocksTaskStore (CF "todos")  │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! There is no transaction across items: concurrent changesets from
//! different participants land in arrival order and the last write to a
//! field wins.

pub mod memory;
pub mod rocks;

pub use memory::MemoryTaskStore;
pub use rocks::{RocksTaskStore, StoreConfig};

use taskflow_core::{Changeset, PartialTask, Task, TaskId};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend failure
    DatabaseError(String),
    /// No record with this id
    NotFound(TaskId),
    /// A record with this id already exists
    AlreadyExists(TaskId),
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Task not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "Task already exists: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Flat record storage behind the server.
pub trait TaskRepository: Send + Sync {
    /// Every persisted record, ordered by id.
    fn list(&self) -> Result<Vec<Task>, StoreError>;

    fn get(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// Insert a new record. Fails with `AlreadyExists` if the id is taken.
    fn create(&self, task: &Task) -> Result<(), StoreError>;

    /// Merge every present field of `patch` into the stored record.
    fn update(&self, patch: &PartialTask) -> Result<Task, StoreError>;

    /// Delete all listed ids in one operation. Unknown ids are ignored.
    ///
    /// Returns how many records were actually removed.
    fn delete_many(&self, ids: &[TaskId]) -> Result<usize, StoreError>;
}

/// Which half of a changeset an item failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOp {
    Create,
    Update,
    Delete,
}

/// One item of a changeset that could not be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceItemFailure {
    pub op: PersistOp,
    /// Empty for a failed bulk delete
    pub id: TaskId,
    pub error: StoreError,
}

/// Outcome of applying one changeset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub failures: Vec<PersistenceItemFailure>,
}

impl PersistReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Apply a `save-changes` payload to a repository.
///
/// Creates and updates are attempted one by one; a failing item is logged,
/// recorded and skipped. Removals go out as a single bulk delete.
pub fn apply_changeset(repo: &dyn TaskRepository, changes: &Changeset) -> PersistReport {
    let mut report = PersistReport::default();

    for task in &changes.created {
        match repo.create(task) {
            Ok(()) => report.created += 1,
            Err(error) => {
                log::error!("Failed to create task {}: {error}", task.id);
                report.failures.push(PersistenceItemFailure {
                    op: PersistOp::Create,
                    id: task.id.clone(),
                    error,
                });
            }
        }
    }

    if !changes.removed.is_empty() {
        match repo.delete_many(&changes.removed) {
            Ok(count) => report.removed = count,
            Err(error) => {
                log::error!("Failed to delete {} task(s): {error}", changes.removed.len());
                report.failures.push(PersistenceItemFailure {
                    op: PersistOp::Delete,
                    id: TaskId::new(),
                    error,
                });
            }
        }
    }

    for patch in &changes.updated {
        match repo.update(patch) {
            Ok(_) => report.updated += 1,
            Err(error) => {
                log::error!("Failed to update task {}: {error}", patch.id);
                report.failures.push(PersistenceItemFailure {
                    op: PersistOp::Update,
                    id: patch.id.clone(),
                    error,
                });
            }
        }
    }

    log::debug!(
        "Persisted changeset: {} created, {} updated, {} removed, {} failed",
        report.created,
        report.updated,
        report.removed,
        report.failures.len()
    );
    report
}
