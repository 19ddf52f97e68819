use chrono::Utc;
use tracing::info;

use crate::record::Record;
use crate::store::{RecordStore, StoreError};

/// Flushes buffered records into the shared store. The caller owns the
/// buffer; it is cleared only after the store confirms the write, so a
/// failed flush leaves the same batch ready for retry.
pub struct IncrementalWriter {
    store: Box<dyn RecordStore>,
}

impl IncrementalWriter {
    pub fn new(store: Box<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    /// Stamp, dedup against the store, and append. Returns the number of
    /// records actually written (0 for an empty buffer or an all-duplicate
    /// batch).
    pub fn flush(&self, buffer: &mut Vec<Record>) -> Result<usize, StoreError> {
        if buffer.is_empty() {
            return Ok(0);
        }
        let stamp = Utc::now().to_rfc3339();
        for record in buffer.iter_mut() {
            record.scraped_at = Some(stamp.clone());
        }

        let written = self.store.merge(buffer)?;
        info!(
            batch = buffer.len(),
            written,
            duplicates = buffer.len() - written,
            "flushed batch"
        );
        buffer.clear();
        Ok(written)
    }
}
