use std::path::PathBuf;
use std::time::Duration;

/// Knobs for one driver run. Built by the CLI and passed in explicitly;
/// there is no process-wide configuration state.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    /// First page of the crawl (1-based).
    pub start_page: u32,
    /// Last page, inclusive. None means run until the empty-page budget
    /// is exhausted.
    pub end_page: Option<u32>,
    /// Restart from the persisted checkpoint instead of `start_page`.
    pub resume: bool,
    /// Buffered records per flush.
    pub batch_size: usize,
    /// Consecutive pages with zero new records before the crawl halts.
    pub max_empty_pages: u32,
    /// Retries per profile after the first failed extraction attempt.
    pub profile_retries: u32,
    /// Retries per page load after the first failed attempt. Exhaustion is
    /// fatal to the worker's whole range.
    pub nav_retries: u32,
    /// Retries for the forced page-boundary flush.
    pub flush_retries: u32,
    /// First backoff step; doubles per attempt.
    pub backoff_base: Duration,
    /// Show an indicatif progress line. Off in partitioned mode.
    pub progress: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            start_page: 1,
            end_page: None,
            resume: false,
            batch_size: 20,
            max_empty_pages: 3,
            profile_retries: 2,
            nav_retries: 3,
            flush_retries: 2,
            backoff_base: Duration::from_millis(2000),
            progress: true,
        }
    }
}

impl ScrapeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.start_page >= 1, "start page must be >= 1");
        anyhow::ensure!(self.batch_size >= 1, "batch size must be >= 1");
        if let Some(end) = self.end_page {
            anyhow::ensure!(
                end >= self.start_page,
                "end page {} precedes start page {}",
                end,
                self.start_page
            );
        }
        Ok(())
    }
}

/// Which backing store holds records and checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// CSV file + sidecar advisory lock + plain-text checkpoint file.
    Csv,
    /// Single SQLite database holding records and keyed checkpoints.
    Sqlite,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Csv => write!(f, "csv"),
            Backend::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Where the shared output lives.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: Backend,
    /// Output store path (CSV file or SQLite database).
    pub out: PathBuf,
    /// Checkpoint file path; ignored by the SQLite backend, which keeps
    /// checkpoints in the database.
    pub checkpoint: PathBuf,
    /// Bound on waiting for the store lock before a flush fails.
    pub lock_timeout: Duration,
}

impl StoreConfig {
    pub fn new(backend: Backend, out: impl Into<PathBuf>, checkpoint: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            out: out.into(),
            checkpoint: checkpoint.into(),
            lock_timeout: Duration::from_secs(120),
        }
    }
}
