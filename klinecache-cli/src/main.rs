//! Klinecache CLI: keep kline windows current and inspect their snapshots.
//!
//! Commands:
//! - `run`: startup routine, then the minute/day scheduler
//! - `init`: full initialization of one or both intervals, then exit
//! - `tick`: warm start from the snapshot and run one job
//! - `show`: print or export a persisted window
//! - `status`: snapshot metadata per interval

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use klinecache_core::config::{Config, StorageBackend};
use klinecache_core::data::{BarSource, BybitFetcher};
use klinecache_core::domain::{normalize_symbol, Interval};
use klinecache_core::persist::{BarCodec, FileKv, KvStore, MemoryKv, RedisKv, SnapshotStore};
use klinecache_core::window::{SyncReport, WindowStore};
use klinecache_runner::{JobLock, Orchestrator, Scheduler, TickReport};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "klinecache", about = "Kline window cache fed from Bybit")]
struct Cli {
    /// Path to a TOML config file. Environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize both intervals, then run the minute and day jobs.
    Run {
        /// Stop after this many seconds instead of running until killed.
        #[arg(long)]
        max_runtime_secs: Option<u64>,
    },
    /// Fully initialize windows from upstream and flush them.
    Init {
        /// Only this interval (minute|day). Defaults to both.
        #[arg(long)]
        interval: Option<Interval>,
    },
    /// Run one job for an interval, continuing from the persisted snapshot.
    Tick {
        /// minute|day
        interval: Interval,
    },
    /// Print a persisted window.
    Show {
        symbol: String,

        #[arg(long, default_value = "minute")]
        interval: Interval,

        /// Only the newest N bars.
        #[arg(long)]
        limit: Option<usize>,

        /// Write the bars to a CSV file instead of stdout.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Report snapshot metadata for both intervals.
    Status,
}

fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())
        .with_context(|| "failed to load configuration")?;

    match cli.command {
        Commands::Run { max_runtime_secs } => run_forever(&config, max_runtime_secs),
        Commands::Init { interval } => run_init(&config, interval),
        Commands::Tick { interval } => run_tick(&config, interval),
        Commands::Show {
            symbol,
            interval,
            limit,
            csv,
        } => run_show(&config, &symbol, interval, limit, csv.as_deref()),
        Commands::Status => run_status(&config),
    }
}

fn open_kv(config: &Config) -> Result<Arc<dyn KvStore>> {
    Ok(match config.storage.backend {
        StorageBackend::Memory => {
            warn!("memory store selected, snapshots vanish on exit");
            Arc::new(MemoryKv::new())
        }
        StorageBackend::File => Arc::new(
            FileKv::open(&config.storage.dir)
                .with_context(|| format!("opening store at {}", config.storage.dir.display()))?,
        ),
        StorageBackend::Redis => Arc::new(
            RedisKv::open(&config.storage.redis).context("configuring redis store")?,
        ),
    })
}

fn snapshot_store(config: &Config, kv: Arc<dyn KvStore>) -> SnapshotStore {
    SnapshotStore::new(kv, BarCodec::new(config.storage.compress))
}

fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let kv = open_kv(config)?;
    let source: Box<dyn BarSource> = Box::new(
        BybitFetcher::from_config(&config.upstream).context("building HTTP client")?,
    );
    let mut orchestrator = Orchestrator::new(
        WindowStore::new(config.keep),
        source,
        snapshot_store(config, kv.clone()),
        config.symbols.clone(),
        config.schedule,
    );
    if config.schedule.use_lock {
        let ttl = Duration::from_secs(config.schedule.lock_ttl_secs);
        orchestrator = orchestrator.with_lock(JobLock::new(kv, ttl));
    }
    Ok(orchestrator)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn run_forever(config: &Config, max_runtime_secs: Option<u64>) -> Result<()> {
    let mut orchestrator = build_orchestrator(config)?;
    info!(
        symbols = ?config.symbols,
        keep_minute = config.keep.minute,
        keep_day = config.keep.day,
        "starting"
    );

    let startup = orchestrator.startup(now_ms());
    for report in [&startup.minute, &startup.day].into_iter().flatten() {
        print_sync(report);
    }
    for e in &startup.errors {
        eprintln!("startup: {e}");
    }

    let stop = Arc::new(AtomicBool::new(false));
    if let Some(secs) = max_runtime_secs {
        let stop = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            stop.store(true, Ordering::Relaxed);
        });
    }

    let stats = Scheduler::new(config.schedule).run(&mut orchestrator, &stop);
    println!(
        "minute ticks: {}  day ticks: {}  skipped: {}  failed: {}",
        stats.minute_ticks, stats.day_ticks, stats.skipped_ticks, stats.failed_ticks
    );
    Ok(())
}

fn run_init(config: &Config, interval: Option<Interval>) -> Result<()> {
    let mut orchestrator = build_orchestrator(config)?;
    let intervals: Vec<Interval> = match interval {
        Some(iv) => vec![iv],
        None => Interval::ALL.to_vec(),
    };

    let mut ok = true;
    for iv in intervals {
        match orchestrator.initialize(iv, now_ms())? {
            Some(report) => {
                print_sync(&report);
                ok &= report.all_succeeded();
            }
            None => {
                eprintln!("[{iv}] skipped, job lock held elsewhere");
                ok = false;
            }
        }
    }
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn run_tick(config: &Config, interval: Interval) -> Result<()> {
    let mut orchestrator = build_orchestrator(config)?;
    let warm = orchestrator.warm_start(interval, now_ms());
    print_sync(&warm);

    let report = orchestrator.run_tick(interval, now_ms())?;
    print_tick(&report);
    if !report.failed.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_show(
    config: &Config,
    symbol: &str,
    interval: Interval,
    limit: Option<usize>,
    csv_path: Option<&Path>,
) -> Result<()> {
    let symbol = normalize_symbol(symbol);
    if symbol.is_empty() {
        bail!("symbol must not be empty");
    }
    let snapshots = snapshot_store(config, open_kv(config)?);
    let stored = snapshots.load_window(&symbol, interval)?;
    if stored.bars.is_empty() {
        println!("No {interval} bars stored for {symbol}.");
        return Ok(());
    }

    let skip = limit.map_or(0, |n| stored.bars.len().saturating_sub(n));
    let bars = &stored.bars[skip..];

    if let Some(path) = csv_path {
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("creating {}", path.display()))?;
        for bar in bars {
            wtr.serialize(bar)?;
        }
        wtr.flush()?;
        println!("Wrote {} bars to {}", bars.len(), path.display());
        return Ok(());
    }

    println!(
        "{symbol} {interval}: {} bars, last_ts {}",
        stored.bars.len(),
        stored.last_ts.map_or_else(|| "-".to_string(), format_ts)
    );
    println!(
        "{:<20} {:>14} {:>14} {:>14} {:>14}",
        "Time (UTC)", "Open", "High", "Low", "Close"
    );
    println!("{}", "-".repeat(80));
    for bar in bars {
        println!(
            "{:<20} {:>14} {:>14} {:>14} {:>14}",
            format_ts(bar.timestamp),
            bar.open,
            bar.high,
            bar.low,
            bar.close
        );
    }
    Ok(())
}

fn run_status(config: &Config) -> Result<()> {
    let snapshots = snapshot_store(config, open_kv(config)?);
    match config.storage.backend {
        StorageBackend::File => println!("Store: {}", config.storage.dir.display()),
        StorageBackend::Memory => println!("Store: memory"),
    }

    for interval in Interval::ALL {
        let meta = snapshots.snapshot_meta(interval)?;
        println!();
        if meta.is_empty() {
            println!("[{interval}] no snapshot");
            continue;
        }
        println!(
            "[{interval}] schema {}  updated {}",
            meta.schema_version.as_deref().unwrap_or("?"),
            meta.updated_at.as_deref().unwrap_or("?")
        );
        println!("{:<14} {:>8} {:>22} {:>10}", "Symbol", "Bars", "Last bar (UTC)", "Size");
        println!("{}", "-".repeat(58));
        for (symbol, sym) in &meta.symbols {
            let bars = sym
                .bars
                .map_or_else(|| "corrupt".to_string(), |n| n.to_string());
            let last = sym.last_ts.map_or_else(|| "-".to_string(), format_ts);
            println!(
                "{:<14} {:>8} {:>22} {:>10}",
                symbol,
                bars,
                last,
                format_size(sym.payload_bytes)
            );
        }
        let missing: Vec<&str> = config
            .symbols
            .iter()
            .filter(|s| !meta.symbols.contains_key(s.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            println!("not yet stored: {}", missing.join(", "));
        }
    }
    Ok(())
}

fn print_sync(report: &SyncReport) {
    for (symbol, n) in &report.synced {
        println!("[{}] {symbol}: {n} bars", report.interval);
    }
    for symbol in &report.backfilled {
        println!("[{}] {symbol}: backfilled from upstream", report.interval);
    }
    for (symbol, err) in &report.failed {
        eprintln!("[{}] {symbol}: {err}", report.interval);
    }
    match &report.flush {
        Some(Ok(n)) => println!("[{}] flushed {n} symbol(s)", report.interval),
        Some(Err(e)) => eprintln!("[{}] flush failed: {e}", report.interval),
        None => {}
    }
}

fn print_tick(report: &TickReport) {
    if report.skipped {
        println!("[{}] skipped, job lock held elsewhere", report.interval);
        return;
    }
    for (symbol, outcome) in &report.merged {
        println!(
            "[{}] {symbol}: +{} new, {} overwritten, {} evicted",
            report.interval, outcome.inserted, outcome.overwritten, outcome.evicted
        );
    }
    for symbol in &report.up_to_date {
        println!("[{}] {symbol}: up to date", report.interval);
    }
    for (symbol, err) in &report.failed {
        eprintln!("[{}] {symbol}: {err}", report.interval);
    }
    println!("[{}] flushed {} symbol(s)", report.interval, report.flushed);
}

fn format_ts(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn format_size(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
