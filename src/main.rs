use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use gradscrape::config::{Backend, ScrapeConfig, StoreConfig};
use gradscrape::driver::Driver;
use gradscrape::fetch::HttpFetcher;
use gradscrape::partition;
use gradscrape::store;
use gradscrape::writer::IncrementalWriter;

const DEFAULT_BASE_URL: &str = "https://www.thegradcafe.com/survey/";

#[derive(Parser)]
#[command(name = "gradscrape", about = "Resumable admissions-survey scraper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl listing pages and persist profiles incrementally
    Scrape {
        /// First page to crawl
        #[arg(long, default_value_t = 1)]
        start_page: u32,
        /// Last page, inclusive (default: crawl until pages run dry)
        #[arg(long)]
        end_page: Option<u32>,
        /// Restart from the saved checkpoint
        #[arg(long)]
        resume: bool,
        /// Buffered records per flush
        #[arg(long, default_value_t = 20)]
        batch_size: usize,
        /// Consecutive pages with no new records before stopping
        #[arg(long, default_value_t = 3)]
        max_empty_pages: u32,
        /// Retries per profile after the first failed extraction
        #[arg(long, default_value_t = 2)]
        profile_retries: u32,
        /// Parallel workers over disjoint page ranges (requires --end-page)
        #[arg(short, long, default_value_t = 1)]
        workers: u32,
        /// Record/checkpoint backend
        #[arg(long, value_enum, default_value_t = Backend::Csv)]
        backend: Backend,
        /// Output store path
        #[arg(long, default_value = "data/profiles.csv")]
        out: PathBuf,
        /// Checkpoint file path (csv backend)
        #[arg(long, default_value = "data/last_page.txt")]
        checkpoint: PathBuf,
        /// Seconds to wait for the store lock before a flush fails
        #[arg(long, default_value_t = 120)]
        lock_timeout: u64,
        /// Survey listing base URL
        #[arg(long, default_value = DEFAULT_BASE_URL)]
        base_url: String,
    },
    /// Show store statistics
    Stats {
        #[arg(long, value_enum, default_value_t = Backend::Csv)]
        backend: Backend,
        #[arg(long, default_value = "data/profiles.csv")]
        out: PathBuf,
    },
    /// Stored profiles overview table
    Overview {
        /// Filter by decision (e.g. "Accepted", "Rejected")
        #[arg(short, long)]
        decision: Option<String>,
        /// Filter by institution substring
        #[arg(short, long)]
        institution: Option<String>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,
        #[arg(long, value_enum, default_value_t = Backend::Csv)]
        backend: Backend,
        #[arg(long, default_value = "data/profiles.csv")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Scrape {
            start_page,
            end_page,
            resume,
            batch_size,
            max_empty_pages,
            profile_retries,
            workers,
            backend,
            out,
            checkpoint,
            lock_timeout,
            base_url,
        } => {
            let cfg = ScrapeConfig {
                start_page,
                end_page,
                resume,
                batch_size,
                max_empty_pages,
                profile_retries,
                progress: workers <= 1,
                ..Default::default()
            };
            cfg.validate()?;
            let mut store_cfg = StoreConfig::new(backend, out, checkpoint);
            store_cfg.lock_timeout = Duration::from_secs(lock_timeout);

            if workers > 1 {
                let reports =
                    partition::run_partitioned(&cfg, &store_cfg, &base_url, workers).await?;
                let mut failed = 0;
                for (range, outcome) in &reports {
                    match outcome {
                        Ok(summary) => println!(
                            "{range}: {} pages, {} new records ({})",
                            summary.pages, summary.written, summary.stopped
                        ),
                        Err(e) => {
                            failed += 1;
                            eprintln!("{range}: FAILED: {e:#}");
                        }
                    }
                }
                anyhow::ensure!(failed == 0, "{failed} worker(s) failed");
                Ok(())
            } else {
                let source = HttpFetcher::new(&base_url)?;
                let writer = IncrementalWriter::new(store::open_record_store(&store_cfg));
                let checkpoint = store::open_checkpoint(&store_cfg, None);
                let summary = Driver::new(cfg, Box::new(source), writer, checkpoint)
                    .run()
                    .await?;
                summary.print();
                Ok(())
            }
        }
        Commands::Stats { backend, out } => {
            let store_cfg = StoreConfig::new(backend, out, PathBuf::new());
            let records = store::open_record_store(&store_cfg).read_all()?;
            if records.is_empty() {
                println!("Store is empty. Run 'scrape' first.");
                return Ok(());
            }

            let mut by_decision: BTreeMap<String, usize> = BTreeMap::new();
            for r in &records {
                let key = r.decision.clone().unwrap_or_else(|| "(unknown)".into());
                *by_decision.entry(key).or_default() += 1;
            }
            let latest = records
                .iter()
                .filter_map(|r| r.scraped_at.as_deref())
                .max()
                .unwrap_or("-");

            println!("Profiles:     {}", records.len());
            println!("Last scraped: {}", latest);
            println!("Decisions:");
            for (decision, count) in by_decision {
                println!("  {:<12} {}", decision, count);
            }
            Ok(())
        }
        Commands::Overview {
            decision,
            institution,
            limit,
            backend,
            out,
        } => {
            let store_cfg = StoreConfig::new(backend, out, PathBuf::new());
            let records = store::open_record_store(&store_cfg).read_all()?;

            let rows: Vec<_> = records
                .iter()
                .filter(|r| match &decision {
                    Some(d) => r
                        .decision
                        .as_deref()
                        .is_some_and(|v| v.eq_ignore_ascii_case(d)),
                    None => true,
                })
                .filter(|r| match &institution {
                    Some(i) => r
                        .institution
                        .as_deref()
                        .is_some_and(|v| v.to_lowercase().contains(&i.to_lowercase())),
                    None => true,
                })
                .take(limit)
                .collect();

            if rows.is_empty() {
                println!("No profiles found.");
                return Ok(());
            }

            println!(
                "{:>3} | {:<10} | {:<24} | {:<24} | {:<10} | {:>4} | {:<14}",
                "#", "ID", "Institution", "Program", "Decision", "GPA", "Notified"
            );
            println!("{}", "-".repeat(108));
            for (i, r) in rows.iter().enumerate() {
                let gpa = r
                    .undergrad_gpa
                    .map(|g| format!("{g:.2}"))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:>3} | {:<10} | {:<24} | {:<24} | {:<10} | {:>4} | {:<14}",
                    i + 1,
                    truncate(&r.id, 10),
                    truncate(r.institution.as_deref().unwrap_or("-"), 24),
                    truncate(r.program.as_deref().unwrap_or("-"), 24),
                    truncate(r.decision.as_deref().unwrap_or("-"), 10),
                    gpa,
                    truncate(r.notification_date.as_deref().unwrap_or("-"), 14),
                );
            }
            println!("\n{} profiles shown", rows.len());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
