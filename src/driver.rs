use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use tracing::{info, warn};

use crate::config::ScrapeConfig;
use crate::fetch::{PageSource, ProfileHandle};
use crate::ledger::DedupLedger;
use crate::record::Record;
use crate::store::{CheckpointStore, StoreError};
use crate::writer::IncrementalWriter;

/// Why a run ended on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndPageReached,
    EmptyStreak,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::EndPageReached => write!(f, "end page reached"),
            StopReason::EmptyStreak => write!(f, "empty-page budget exhausted"),
        }
    }
}

/// Counters reported after a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Pages fully processed and checkpointed.
    pub pages: u32,
    /// Records the store confirmed as new.
    pub written: usize,
    /// Profiles abandoned after the retry budget.
    pub skipped: usize,
    /// Records dropped for missing an id.
    pub dropped: usize,
    /// Records filtered by the run-local ledger.
    pub duplicates: usize,
    pub stopped: StopReason,
}

impl RunSummary {
    pub fn print(&self) {
        println!(
            "Done: {} pages, {} new records ({} skipped, {} dropped, {} duplicates). Stopped: {}.",
            self.pages, self.written, self.skipped, self.dropped, self.duplicates, self.stopped
        );
    }
}

#[derive(Debug, Default)]
struct Counters {
    pages: u32,
    written: usize,
    skipped: usize,
    dropped: usize,
    duplicates: usize,
}

/// Sequential pagination/extraction state machine for one page range.
/// Owns the run-local ledger and the un-flushed buffer; everything durable
/// goes through the writer and the checkpoint store.
pub struct Driver {
    cfg: ScrapeConfig,
    source: Box<dyn PageSource>,
    writer: IncrementalWriter,
    checkpoint: Box<dyn CheckpointStore>,
    ledger: DedupLedger,
    buffer: Vec<Record>,
    stats: Counters,
}

impl Driver {
    pub fn new(
        cfg: ScrapeConfig,
        source: Box<dyn PageSource>,
        writer: IncrementalWriter,
        checkpoint: Box<dyn CheckpointStore>,
    ) -> Self {
        Self {
            cfg,
            source,
            writer,
            checkpoint,
            ledger: DedupLedger::new(),
            buffer: Vec::new(),
            stats: Counters::default(),
        }
    }

    /// Run to completion. Profile-level failures are skipped; page
    /// navigation or persistence failures that outlive their retry budget
    /// abort the whole range with the error surfaced.
    pub async fn run(mut self) -> Result<RunSummary> {
        self.cfg.validate()?;
        self.writer.store().ensure_schema()?;

        let mut page = self.resume_page();
        info!(
            start = page,
            end = ?self.cfg.end_page,
            batch_size = self.cfg.batch_size,
            "starting crawl"
        );

        let bar = self.progress_bar(page);
        let mut empty_streak = 0u32;

        let stopped = loop {
            if let Some(end) = self.cfg.end_page {
                if page > end {
                    break StopReason::EndPageReached;
                }
            }

            let written_before = self.stats.written;
            self.load_with_retry(page).await?;
            let handles = self.source.listing();
            self.process_page(page, &handles).await?;

            // Forced flush before the checkpoint may move: the page is only
            // "done" once its records are durable.
            self.flush_with_retry(page).await?;
            // Store-confirmed count, so a resumed run over an already
            // scraped range still drains its empty-page budget.
            let new_on_page = self.stats.written - written_before;
            self.checkpoint
                .save(page)
                .with_context(|| format!("saving checkpoint for page {page}"))?;
            self.stats.pages += 1;

            if let Some(bar) = &bar {
                bar.set_message(format!("page {page}"));
                bar.inc(1);
            }

            if new_on_page == 0 {
                empty_streak += 1;
                info!(page, empty_streak, "page produced no new records");
                if empty_streak >= self.cfg.max_empty_pages {
                    break StopReason::EmptyStreak;
                }
            } else {
                empty_streak = 0;
            }
            page += 1;
        };

        if let Some(bar) = bar {
            bar.finish_and_clear();
        }

        let summary = RunSummary {
            pages: self.stats.pages,
            written: self.stats.written,
            skipped: self.stats.skipped,
            dropped: self.stats.dropped,
            duplicates: self.stats.duplicates,
            stopped,
        };
        info!(
            pages = summary.pages,
            written = summary.written,
            skipped = summary.skipped,
            "crawl finished: {}",
            summary.stopped
        );
        Ok(summary)
    }

    /// Where to start: the checkpoint names the last fully flushed page, so
    /// a resume re-processes that page (dedup makes it a no-op) rather than
    /// trusting that its checkpoint write raced ahead of a crash.
    fn resume_page(&self) -> u32 {
        if !self.cfg.resume {
            return self.cfg.start_page;
        }
        match self.checkpoint.load() {
            Ok(Some(page)) => {
                let page = page.max(self.cfg.start_page);
                info!(page, "resuming from checkpoint");
                page
            }
            Ok(None) => {
                info!(start = self.cfg.start_page, "no checkpoint; starting fresh");
                self.cfg.start_page
            }
            Err(e) => {
                warn!(error = %e, start = self.cfg.start_page, "checkpoint unreadable; starting fresh");
                self.cfg.start_page
            }
        }
    }

    async fn process_page(&mut self, page: u32, handles: &[ProfileHandle]) -> Result<()> {
        for handle in handles {
            let record = match self.extract_with_retry(page, handle).await {
                Some(record) => record,
                None => {
                    self.stats.skipped += 1;
                    continue;
                }
            };
            if record.id.is_empty() {
                warn!(page, index = handle.index, "record has no id; dropped");
                self.stats.dropped += 1;
                continue;
            }
            if self.ledger.seen(&record.id) {
                self.stats.duplicates += 1;
                continue;
            }
            self.ledger.mark(&record.id);
            self.buffer.push(record);

            if self.buffer.len() >= self.cfg.batch_size {
                // Batch-boundary flush. A failure here is tolerated: the
                // buffer is kept and the page-boundary flush retries it.
                if let Err(e) = self.flush_once() {
                    warn!(page, error = %e, "batch flush failed; retrying at page boundary");
                }
            }
        }
        Ok(())
    }

    async fn extract_with_retry(&mut self, page: u32, handle: &ProfileHandle) -> Option<Record> {
        let mut attempt = 0;
        loop {
            match self.source.extract(handle).await {
                Ok(record) => return Some(record),
                Err(e) if e.is_transient() && attempt < self.cfg.profile_retries => {
                    attempt += 1;
                    warn!(
                        page,
                        index = handle.index,
                        attempt,
                        error = %e,
                        "extraction failed; re-navigating and retrying"
                    );
                    self.backoff(attempt - 1).await;
                    if let Err(nav) = self.source.load(page).await {
                        warn!(page, error = %nav, "re-navigation before retry failed");
                    }
                }
                Err(e) => {
                    warn!(page, index = handle.index, error = %e, "profile skipped");
                    return None;
                }
            }
        }
    }

    async fn load_with_retry(&mut self, page: u32) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.source.load(page).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.cfg.nav_retries => {
                    attempt += 1;
                    warn!(page, attempt, error = %e, "page load failed; backing off");
                    self.backoff(attempt - 1).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("loading page {page}"));
                }
            }
        }
    }

    fn flush_once(&mut self) -> Result<(), StoreError> {
        let written = self.writer.flush(&mut self.buffer)?;
        self.stats.written += written;
        Ok(())
    }

    async fn flush_with_retry(&mut self, page: u32) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.flush_once() {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.cfg.flush_retries => {
                    attempt += 1;
                    warn!(page, attempt, error = %e, "page flush failed; backing off");
                    self.backoff(attempt - 1).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("flushing records for page {page}"));
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        let base = self.cfg.backoff_base * 2u32.saturating_pow(attempt);
        let jitter = rand::thread_rng().gen_range(1.0..1.25);
        tokio::time::sleep(base.mul_f64(jitter)).await;
    }

    fn progress_bar(&self, from: u32) -> Option<ProgressBar> {
        if !self.cfg.progress {
            return None;
        }
        let bar = match self.cfg.end_page {
            Some(end) => {
                let total = end.saturating_sub(from) as u64 + 1;
                let bar = ProgressBar::new(total);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("[{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
                        .ok()?
                        .progress_chars("=> "),
                );
                bar
            }
            None => ProgressBar::new_spinner(),
        };
        Some(bar)
    }
}
