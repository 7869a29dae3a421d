//! RocksDB-backed task repository.
//!
//! Column families:
//! - `todos`: one record per task, keyed by the task id (UTF-8),
//!   value is the bincode-encoded [`Task`]; LZ4 block compression.
//!
//! Writes that read before writing (create, update) are serialized by a
//! store-level lock so two connections cannot interleave on one record.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use taskflow_core::{PartialTask, Task, TaskId};

use super::{StoreError, TaskRepository};

/// Column family holding task records.
const CF_TODOS: &str = "todos";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("taskflow_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config at `path` with the default tuning.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

fn encode(task: &Task) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(task, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<Task, StoreError> {
    let (task, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(task)
}

/// Durable task repository.
pub struct RocksTaskStore {
    /// RocksDB instance (single-threaded mode; concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    write_lock: Mutex<()>,
}

impl RocksTaskStore {
    /// Open the store, creating the database and column family if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let descriptor = ColumnFamilyDescriptor::new(CF_TODOS, Self::cf_options(&config));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![descriptor],
        )?;

        log::info!("Opened task store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_TODOS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn put(&self, task: &Task) -> Result<(), StoreError> {
        let cf = self.cf(CF_TODOS)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(cf, task.id.as_bytes(), encode(task)?, &write_opts)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl TaskRepository for RocksTaskStore {
    fn list(&self) -> Result<Vec<Task>, StoreError> {
        let cf = self.cf(CF_TODOS)?;
        let mut tasks = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            tasks.push(decode(&value)?);
        }
        Ok(tasks)
    }

    fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let cf = self.cf(CF_TODOS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn create(&self, task: &Task) -> Result<(), StoreError> {
        let _guard = self.lock();
        if self.get(&task.id)?.is_some() {
            return Err(StoreError::AlreadyExists(task.id.clone()));
        }
        self.put(task)
    }

    fn update(&self, patch: &PartialTask) -> Result<Task, StoreError> {
        let _guard = self.lock();
        let mut task = self
            .get(&patch.id)?
            .ok_or_else(|| StoreError::NotFound(patch.id.clone()))?;
        task.merge_exact(patch);
        self.put(&task)?;
        Ok(task)
    }

    fn delete_many(&self, ids: &[TaskId]) -> Result<usize, StoreError> {
        let _guard = self.lock();
        let cf = self.cf(CF_TODOS)?;

        let mut batch = WriteBatch::default();
        let mut removed = 0;
        for id in ids {
            if self.db.get_pinned_cf(cf, id.as_bytes())?.is_some() {
                batch.delete_cf(cf, id.as_bytes());
                removed += 1;
            }
        }
        if removed > 0 {
            let mut write_opts = WriteOptions::default();
            write_opts.set_sync(self.config.sync_writes);
            self.db.write_opt(batch, &write_opts)?;
        }
        Ok(removed)
    }
}

/// Get number of available CPUs (for RocksDB parallelism).
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
