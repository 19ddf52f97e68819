pub mod csv;
pub mod sqlite;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{Backend, StoreConfig};
use crate::record::Record;

pub use self::csv::{CsvStore, FileCheckpoint};
pub use self::sqlite::{SqliteCheckpoint, SqliteStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv: {0}")]
    Csv(#[from] ::csv::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("lock on {path:?} not acquired within {timeout:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },
}

/// Durable, id-keyed table of records. All mutation goes through `merge`,
/// which must be safe against concurrent writers on the same backing file.
pub trait RecordStore: Send + Sync {
    /// Create the backing file/schema if absent. Idempotent.
    fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Merge a batch into the store, dropping records whose id is already
    /// present. Returns the number of records actually written. Replaying
    /// the same batch twice never duplicates rows.
    fn merge(&self, batch: &[Record]) -> Result<usize, StoreError>;

    /// Read every stored record, insertion order.
    fn read_all(&self) -> Result<Vec<Record>, StoreError>;
}

/// Last fully flushed page index, persisted across restarts.
pub trait CheckpointStore: Send + Sync {
    fn load(&self) -> Result<Option<u32>, StoreError>;
    fn save(&self, page: u32) -> Result<(), StoreError>;
}

/// Open the configured record-store backend.
pub fn open_record_store(cfg: &StoreConfig) -> Box<dyn RecordStore> {
    match cfg.backend {
        Backend::Csv => Box::new(CsvStore::new(&cfg.out, cfg.lock_timeout)),
        Backend::Sqlite => Box::new(SqliteStore::new(&cfg.out, cfg.lock_timeout)),
    }
}

/// Open the checkpoint for a whole run, or for one worker's partition when
/// a range is given.
pub fn open_checkpoint(cfg: &StoreConfig, range: Option<(u32, u32)>) -> Box<dyn CheckpointStore> {
    match cfg.backend {
        Backend::Csv => {
            let path = match range {
                Some((start, end)) => partition_checkpoint_path(&cfg.checkpoint, start, end),
                None => cfg.checkpoint.clone(),
            };
            Box::new(FileCheckpoint::new(path))
        }
        Backend::Sqlite => {
            let key = match range {
                Some((start, end)) => format!("p{start}-{end}"),
                None => "default".to_string(),
            };
            Box::new(SqliteCheckpoint::new(
                SqliteStore::new(&cfg.out, cfg.lock_timeout),
                key,
            ))
        }
    }
}

/// Checkpoint path for one worker's page range. Each partition owns its own
/// checkpoint; a shared one would be overwritten by whichever worker saved
/// last.
pub fn partition_checkpoint_path(base: &Path, start: u32, end: u32) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("checkpoint");
    let name = match base.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}.p{start}-{end}.{ext}"),
        None => format!("{stem}.p{start}-{end}"),
    };
    base.with_file_name(name)
}
