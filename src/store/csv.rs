use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use super::{CheckpointStore, RecordStore, StoreError};
use crate::record::{Record, COLUMNS};

const LOCK_POLL: Duration = Duration::from_millis(250);

/// CSV-file record store guarded by an advisory lock on a sidecar file.
/// Any process may read; a merge holds the lock across its whole
/// read-filter-rewrite cycle.
#[derive(Debug, Clone)]
pub struct CsvStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl CsvStore {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let path = path.into();
        let lock_path = path.with_file_name(format!(
            "{}.lock",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("store")
        ));
        Self {
            path,
            lock_path,
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn acquire_lock(&self) -> Result<LockGuard, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)?;
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard { file }),
                Err(_) if Instant::now() < deadline => std::thread::sleep(LOCK_POLL),
                Err(_) => {
                    return Err(StoreError::LockTimeout {
                        path: self.lock_path.clone(),
                        timeout: self.lock_timeout,
                    })
                }
            }
        }
    }

    /// Existing rows, or an empty set when the file is absent. A file that
    /// exists but cannot be parsed is treated as empty and logged loudly;
    /// the incoming batch then becomes the entire content.
    fn read_lenient(&self) -> Vec<Record> {
        if !self.path.exists() {
            return Vec::new();
        }
        match read_records(&self.path) {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "output store unreadable; treating as empty (degraded recovery)"
                );
                Vec::new()
            }
        }
    }

    /// Rewrite the whole store atomically: temp file in the same directory,
    /// fsync, then rename over the original.
    fn rewrite(&self, records: &[Record]) -> Result<(), StoreError> {
        let name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("store");
        let tmp = self.path.with_file_name(format!("{name}.tmp"));

        let mut writer = ::csv::Writer::from_writer(File::create(&tmp)?);
        if records.is_empty() {
            writer.write_record(COLUMNS)?;
        } else {
            for record in records {
                writer.serialize(record)?;
            }
        }
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl RecordStore for CsvStore {
    fn ensure_schema(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let _lock = self.acquire_lock()?;
        if !self.path.exists() {
            self.rewrite(&[])?;
            debug!(path = %self.path.display(), "created output store");
        }
        Ok(())
    }

    fn merge(&self, batch: &[Record]) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let _lock = self.acquire_lock()?;

        let mut combined = self.read_lenient();
        let existing: std::collections::HashSet<&str> =
            combined.iter().map(|r| r.id.as_str()).collect();
        let fresh: Vec<Record> = batch
            .iter()
            .filter(|r| !existing.contains(r.id.as_str()))
            .cloned()
            .collect();
        let written = fresh.len();
        drop(existing);

        combined.extend(fresh);
        self.rewrite(&combined)?;
        Ok(written)
    }

    fn read_all(&self) -> Result<Vec<Record>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        read_records(&self.path)
    }
}

fn read_records(path: &Path) -> Result<Vec<Record>, StoreError> {
    let mut reader = ::csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize::<Record>() {
        records.push(row?);
    }
    Ok(records)
}

struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

// ── Checkpoint ──

/// Plain-text page-index checkpoint, written durably before the driver
/// treats the page as done.
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CheckpointStore for FileCheckpoint {
    fn load(&self) -> Result<Option<u32>, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match text.trim().parse::<u32>() {
            Ok(page) => Ok(Some(page)),
            Err(_) => {
                warn!(path = %self.path.display(), "checkpoint unparseable; ignoring");
                Ok(None)
            }
        }
    }

    fn save(&self, page: u32) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("checkpoint");
        let tmp = self.path.with_file_name(format!("{name}.tmp"));
        let mut file = File::create(&tmp)?;
        writeln!(file, "{page}")?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
