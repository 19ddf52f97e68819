use anyhow::{Context, Result};
use tracing::info;

use crate::config::{ScrapeConfig, StoreConfig};
use crate::driver::{Driver, RunSummary};
use crate::fetch::HttpFetcher;
use crate::store;
use crate::writer::IncrementalWriter;

/// One worker's contiguous, inclusive page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl std::fmt::Display for PageRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pages {}-{}", self.start, self.end)
    }
}

/// Split [start, end] into up to `workers` disjoint contiguous ranges
/// covering every page exactly once, sizes differing by at most one.
pub fn partition_range(start: u32, end: u32, workers: u32) -> Vec<PageRange> {
    if end < start {
        return Vec::new();
    }
    let total = end - start + 1;
    let workers = workers.max(1).min(total);
    let chunk = total / workers;
    let remainder = total % workers;

    let mut ranges = Vec::with_capacity(workers as usize);
    let mut cursor = start;
    for i in 0..workers {
        let len = chunk + if i < remainder { 1 } else { 0 };
        ranges.push(PageRange {
            start: cursor,
            end: cursor + len - 1,
        });
        cursor += len;
    }
    ranges
}

/// Run one independent driver per partition, all merging into the same
/// store path (the store's own locking serializes the writers). Each worker
/// owns its fetcher session, its ledger, and its partition-keyed
/// checkpoint; one worker failing does not stop the others.
pub async fn run_partitioned(
    cfg: &ScrapeConfig,
    store_cfg: &StoreConfig,
    base_url: &str,
    workers: u32,
) -> Result<Vec<(PageRange, Result<RunSummary>)>> {
    let end = cfg
        .end_page
        .context("partitioned mode requires an explicit end page")?;
    let ranges = partition_range(cfg.start_page, end, workers);
    info!(workers = ranges.len(), start = cfg.start_page, end, "partitioned crawl");

    let mut handles = Vec::with_capacity(ranges.len());
    for range in ranges {
        let mut worker_cfg = cfg.clone();
        worker_cfg.start_page = range.start;
        worker_cfg.end_page = Some(range.end);
        worker_cfg.progress = false;

        let source = HttpFetcher::new(base_url)?;
        let writer = IncrementalWriter::new(store::open_record_store(store_cfg));
        let checkpoint = store::open_checkpoint(store_cfg, Some((range.start, range.end)));
        let driver = Driver::new(worker_cfg, Box::new(source), writer, checkpoint);

        handles.push((range, tokio::spawn(driver.run())));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for (range, handle) in handles {
        let outcome = match handle.await {
            Ok(result) => result,
            Err(join) => Err(anyhow::anyhow!("worker for {range} panicked: {join}")),
        };
        reports.push((range, outcome));
    }
    Ok(reports)
}
