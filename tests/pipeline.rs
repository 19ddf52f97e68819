//! Driver scenarios against a scripted in-memory page source: dedup across
//! page overlap, resume-at-checkpoint, empty-streak termination, retry and
//! skip behavior, and persistence failure handling.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use gradscrape::config::ScrapeConfig;
use gradscrape::driver::{Driver, StopReason};
use gradscrape::fetch::{FetchError, PageFetcher, ProfileExtractor, ProfileHandle};
use gradscrape::record::Record;
use gradscrape::store::{CheckpointStore, CsvStore, FileCheckpoint, RecordStore};
use gradscrape::writer::IncrementalWriter;

#[derive(Clone)]
struct Profile {
    id: String,
    /// Transient extraction failures served before the first success.
    fail_times: u32,
}

fn ok(id: &str) -> Profile {
    Profile {
        id: id.to_string(),
        fail_times: 0,
    }
}

fn flaky(id: &str, fail_times: u32) -> Profile {
    Profile {
        id: id.to_string(),
        fail_times,
    }
}

fn idless() -> Profile {
    ok("")
}

#[derive(Default)]
struct SourceState {
    load_calls: Vec<u32>,
    failures_left: HashMap<String, u32>,
}

/// Scripted stand-in for a browser session: pages are fixed lists of
/// profiles, pages beyond the script are empty.
struct ScriptedSource {
    pages: Vec<Vec<Profile>>,
    nav_fail: Vec<u32>,
    current: Vec<ProfileHandle>,
    by_target: HashMap<String, Profile>,
    state: Arc<Mutex<SourceState>>,
}

impl ScriptedSource {
    fn new(pages: Vec<Vec<Profile>>) -> (Self, Arc<Mutex<SourceState>>) {
        let state = Arc::new(Mutex::new(SourceState::default()));
        let mut by_target = HashMap::new();
        for (page_idx, profiles) in pages.iter().enumerate() {
            for (i, p) in profiles.iter().enumerate() {
                by_target.insert(target_for(page_idx, i), p.clone());
            }
        }
        let source = Self {
            pages,
            nav_fail: Vec::new(),
            current: Vec::new(),
            by_target,
            state: Arc::clone(&state),
        };
        (source, state)
    }

    fn failing_navigation(mut self, pages: &[u32]) -> Self {
        self.nav_fail = pages.to_vec();
        self
    }
}

fn target_for(page_idx: usize, profile_idx: usize) -> String {
    format!("page{}/profile{}", page_idx, profile_idx)
}

#[async_trait]
impl PageFetcher for ScriptedSource {
    async fn load(&mut self, page: u32) -> Result<(), FetchError> {
        self.state.lock().unwrap().load_calls.push(page);
        if self.nav_fail.contains(&page) {
            return Err(FetchError::Structure(format!("page {page} unavailable")));
        }
        let page_idx = (page - 1) as usize;
        self.current = match self.pages.get(page_idx) {
            Some(profiles) => profiles
                .iter()
                .enumerate()
                .map(|(i, _)| ProfileHandle {
                    index: i,
                    target: target_for(page_idx, i),
                })
                .collect(),
            None => Vec::new(),
        };
        Ok(())
    }

    fn listing(&self) -> Vec<ProfileHandle> {
        self.current.clone()
    }
}

#[async_trait]
impl ProfileExtractor for ScriptedSource {
    async fn extract(&mut self, handle: &ProfileHandle) -> Result<Record, FetchError> {
        let profile = self
            .by_target
            .get(&handle.target)
            .expect("extract called with unknown handle")
            .clone();

        let mut state = self.state.lock().unwrap();
        let left = state
            .failures_left
            .entry(handle.target.clone())
            .or_insert(profile.fail_times);
        if *left > 0 {
            *left -= 1;
            return Err(FetchError::Timeout(handle.target.clone()));
        }
        drop(state);

        let mut record = Record::with_id(profile.id);
        if !record.id.is_empty() {
            record.institution = Some("Test University".into());
            record.decision = Some("Accepted".into());
        }
        Ok(record)
    }
}

// ── Harness ──

struct Rig {
    _dir: TempDir,
    store: CsvStore,
    checkpoint_path: PathBuf,
    cfg: ScrapeConfig,
}

impl Rig {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = CsvStore::new(dir.path().join("profiles.csv"), Duration::from_secs(5));
        let checkpoint_path = dir.path().join("last_page.txt");
        let cfg = ScrapeConfig {
            backoff_base: Duration::from_millis(1),
            progress: false,
            ..Default::default()
        };
        Self {
            _dir: dir,
            store,
            checkpoint_path,
            cfg,
        }
    }

    fn driver(&self, source: ScriptedSource, cfg: ScrapeConfig) -> Driver {
        Driver::new(
            cfg,
            Box::new(source),
            IncrementalWriter::new(Box::new(self.store.clone())),
            Box::new(FileCheckpoint::new(&self.checkpoint_path)),
        )
    }

    fn checkpoint(&self) -> Option<u32> {
        FileCheckpoint::new(&self.checkpoint_path).load().unwrap()
    }

    fn stored_ids(&self) -> Vec<String> {
        self.store
            .read_all()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect()
    }
}

fn pages(script: &[&[Profile]]) -> Vec<Vec<Profile>> {
    script.iter().map(|p| p.to_vec()).collect()
}

// ── Scenarios ──

#[tokio::test]
async fn listing_overlap_writes_each_id_once() {
    let rig = Rig::new();
    let (source, _) = ScriptedSource::new(pages(&[
        &[ok("p1"), ok("p2"), ok("p3")],
        &[ok("p3"), ok("p4"), ok("p5")],
    ]));
    let cfg = ScrapeConfig {
        end_page: Some(2),
        batch_size: 10,
        ..rig.cfg.clone()
    };

    let summary = rig.driver(source, cfg).run().await.unwrap();

    assert_eq!(rig.stored_ids(), vec!["p1", "p2", "p3", "p4", "p5"]);
    assert_eq!(summary.written, 5);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.stopped, StopReason::EndPageReached);
    assert_eq!(rig.checkpoint(), Some(2));
}

#[tokio::test]
async fn resume_restarts_at_checkpointed_page_and_noops() {
    let rig = Rig::new();
    let script = pages(&[&[ok("p1"), ok("p2")], &[ok("p3")]]);

    let (source, _) = ScriptedSource::new(script.clone());
    let cfg = ScrapeConfig {
        end_page: Some(2),
        ..rig.cfg.clone()
    };
    rig.driver(source, cfg.clone()).run().await.unwrap();
    assert_eq!(rig.checkpoint(), Some(2));

    // Second run resumes at page 2 (not 3) and re-processing it is a
    // dedup no-op.
    let (source, state) = ScriptedSource::new(script);
    let resumed_cfg = ScrapeConfig {
        resume: true,
        ..cfg
    };
    let summary = rig.driver(source, resumed_cfg).run().await.unwrap();

    assert_eq!(state.lock().unwrap().load_calls.first(), Some(&2));
    assert_eq!(summary.written, 0);
    assert_eq!(rig.stored_ids().len(), 3);
    assert_eq!(rig.checkpoint(), Some(2));
}

#[tokio::test]
async fn unbounded_crawl_stops_after_empty_streak() {
    let rig = Rig::new();
    let (source, _) = ScriptedSource::new(pages(&[&[ok("p1")]]));
    let cfg = ScrapeConfig {
        end_page: None,
        max_empty_pages: 3,
        ..rig.cfg.clone()
    };

    let summary = rig.driver(source, cfg).run().await.unwrap();

    assert_eq!(summary.stopped, StopReason::EmptyStreak);
    // page 1 with content + three empty pages
    assert_eq!(summary.pages, 4);
    assert_eq!(rig.checkpoint(), Some(4));
}

#[tokio::test]
async fn end_page_bounds_crawl_before_empty_budget() {
    let rig = Rig::new();
    let (source, state) = ScriptedSource::new(pages(&[&[], &[]]));
    let cfg = ScrapeConfig {
        end_page: Some(2),
        max_empty_pages: 10,
        ..rig.cfg.clone()
    };

    let summary = rig.driver(source, cfg).run().await.unwrap();

    assert_eq!(summary.stopped, StopReason::EndPageReached);
    assert_eq!(summary.pages, 2);
    assert!(state.lock().unwrap().load_calls.iter().all(|&p| p <= 2));
}

#[tokio::test]
async fn idless_records_dropped_id_only_records_kept() {
    let rig = Rig::new();
    let (source, _) = ScriptedSource::new(pages(&[&[idless(), ok("solo")]]));
    let cfg = ScrapeConfig {
        end_page: Some(1),
        ..rig.cfg.clone()
    };

    let summary = rig.driver(source, cfg).run().await.unwrap();

    assert_eq!(rig.stored_ids(), vec!["solo"]);
    assert_eq!(summary.dropped, 1);
    assert_eq!(summary.written, 1);
}

#[tokio::test]
async fn transient_failure_retried_after_renavigation() {
    let rig = Rig::new();
    let (source, state) = ScriptedSource::new(pages(&[&[flaky("p1", 1), ok("p2")]]));
    let cfg = ScrapeConfig {
        end_page: Some(1),
        profile_retries: 2,
        ..rig.cfg.clone()
    };

    let summary = rig.driver(source, cfg).run().await.unwrap();

    assert_eq!(summary.written, 2);
    assert_eq!(summary.skipped, 0);
    // initial navigation + one re-navigation before the retry
    let loads = state.lock().unwrap().load_calls.clone();
    assert_eq!(loads, vec![1, 1]);
}

#[tokio::test]
async fn exhausted_retry_budget_skips_profile_not_page() {
    let rig = Rig::new();
    let (source, _) = ScriptedSource::new(pages(&[&[flaky("p1", 10), ok("p2")]]));
    let cfg = ScrapeConfig {
        end_page: Some(1),
        profile_retries: 2,
        ..rig.cfg.clone()
    };

    let summary = rig.driver(source, cfg).run().await.unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(rig.stored_ids(), vec!["p2"]);
    assert_eq!(rig.checkpoint(), Some(1), "page still checkpointed");
}

#[tokio::test]
async fn navigation_failure_aborts_range_after_flushed_pages() {
    let rig = Rig::new();
    let (source, _) = ScriptedSource::new(pages(&[&[ok("p1")], &[ok("p2")]]));
    let source = source.failing_navigation(&[2]);
    let cfg = ScrapeConfig {
        end_page: Some(2),
        ..rig.cfg.clone()
    };

    let err = rig.driver(source, cfg).run().await.unwrap_err();
    assert!(err.to_string().contains("page 2"), "{err:#}");

    // page 1 survived as a valid recovery point
    assert_eq!(rig.stored_ids(), vec!["p1"]);
    assert_eq!(rig.checkpoint(), Some(1));
}

#[tokio::test]
async fn batch_boundary_flushes_bound_data_at_risk() {
    let rig = Rig::new();
    let (source, _) = ScriptedSource::new(pages(&[&[
        ok("a"),
        ok("b"),
        ok("c"),
        ok("d"),
        ok("e"),
    ]]));
    let cfg = ScrapeConfig {
        end_page: Some(1),
        batch_size: 2,
        ..rig.cfg.clone()
    };

    let summary = rig.driver(source, cfg).run().await.unwrap();

    assert_eq!(summary.written, 5);
    assert_eq!(rig.stored_ids().len(), 5);
    let stamped = rig.store.read_all().unwrap();
    assert!(stamped.iter().all(|r| r.scraped_at.is_some()));
}

#[tokio::test]
async fn held_lock_fails_run_with_store_untouched() {
    use fs2::FileExt;
    use std::fs::OpenOptions;

    let rig = Rig::new();
    let store = CsvStore::new(rig.store.path(), Duration::from_millis(100));
    store.ensure_schema().unwrap();
    let holder = OpenOptions::new()
        .create(true)
        .write(true)
        .open(store.lock_path())
        .unwrap();
    holder.lock_exclusive().unwrap();

    let (source, _) = ScriptedSource::new(pages(&[&[ok("p1")]]));
    let cfg = ScrapeConfig {
        end_page: Some(1),
        flush_retries: 1,
        ..rig.cfg.clone()
    };
    let driver = Driver::new(
        cfg,
        Box::new(source),
        IncrementalWriter::new(Box::new(store.clone())),
        Box::new(FileCheckpoint::new(&rig.checkpoint_path)),
    );

    let err = driver.run().await.unwrap_err();
    assert!(err.to_string().contains("flushing"), "{err:#}");
    assert_eq!(rig.checkpoint(), None, "failed page must not checkpoint");

    holder.unlock().unwrap();
    assert!(store.read_all().unwrap().is_empty());
}
