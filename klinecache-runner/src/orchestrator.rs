//! Startup routine and the per-interval jobs.
//!
//! The orchestrator owns the window store and drives it with window math
//! and a bar source, then flushes the interval. Every tick requests closed
//! bars only. A per-symbol fetch failure is logged and skipped; a lock
//! backend or flush failure aborts the tick, and the next tick retries.
//! Startup never fails: an interval it cannot initialize is reported and
//! cold-starts on its first tick.

use crate::lock::{JobLock, LockGuard};
use crate::schedule::near_daily_trigger;
use klinecache_core::config::ScheduleConfig;
use klinecache_core::data::{BarSource, FetchError};
use klinecache_core::domain::{Interval, WindowKey};
use klinecache_core::persist::{PersistError, SnapshotStore};
use klinecache_core::window::{
    compute_fetch_window, updated_at, MergeOutcome, SyncReport, WindowStore,
};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("lock store unavailable for job {job}: {source}")]
    Lock {
        job: &'static str,
        #[source]
        source: PersistError,
    },

    #[error("flush of {interval} snapshot failed: {source}")]
    Flush {
        interval: Interval,
        #[source]
        source: PersistError,
    },
}

/// Outcome of one minute or day job.
#[derive(Debug)]
pub struct TickReport {
    pub interval: Interval,
    pub now_ms: i64,
    /// Another worker held the job lock; nothing was done.
    pub skipped: bool,
    /// Bars received from upstream across all symbols.
    pub fetched: usize,
    pub merged: Vec<(String, MergeOutcome)>,
    /// Symbols with no closed bar newer than their cursor.
    pub up_to_date: Vec<String>,
    pub failed: Vec<(String, FetchError)>,
    /// Symbols written by the flush.
    pub flushed: usize,
}

impl TickReport {
    fn new(interval: Interval, now_ms: i64) -> Self {
        Self {
            interval,
            now_ms,
            skipped: false,
            fetched: 0,
            merged: Vec::new(),
            up_to_date: Vec::new(),
            failed: Vec::new(),
            flushed: 0,
        }
    }
}

/// How the day interval was brought up at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayStartup {
    FullInitialize,
    /// Started inside the guard band around the daily job: warm load only.
    WarmLoad,
}

#[derive(Debug)]
pub struct StartupReport {
    /// `None` when the job lock was held elsewhere or unavailable.
    pub minute: Option<SyncReport>,
    pub day: Option<SyncReport>,
    pub day_mode: DayStartup,
    /// Lock backend failures that kept an interval from initializing.
    pub errors: Vec<JobError>,
}

/// Right to run a job. Dropping a held permit releases the lock.
enum JobPermit {
    Unlocked,
    #[allow(dead_code)] // held only for its drop
    Held(LockGuard),
    Contended,
}

pub struct Orchestrator {
    windows: WindowStore,
    source: Box<dyn BarSource>,
    snapshots: SnapshotStore,
    symbols: Vec<String>,
    schedule: ScheduleConfig,
    lock: Option<JobLock>,
}

impl Orchestrator {
    pub fn new(
        windows: WindowStore,
        source: Box<dyn BarSource>,
        snapshots: SnapshotStore,
        symbols: Vec<String>,
        schedule: ScheduleConfig,
    ) -> Self {
        Self {
            windows,
            source,
            snapshots,
            symbols,
            schedule,
            lock: None,
        }
    }

    /// Serialize jobs across workers sharing the same store.
    pub fn with_lock(mut self, lock: JobLock) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn windows(&self) -> &WindowStore {
        &self.windows
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    fn acquire(&self, interval: Interval) -> Result<JobPermit, JobError> {
        let Some(lock) = &self.lock else {
            return Ok(JobPermit::Unlocked);
        };
        let job = interval.code();
        match lock.try_acquire(job) {
            Ok(Some(guard)) => Ok(JobPermit::Held(guard)),
            Ok(None) => Ok(JobPermit::Contended),
            Err(source) => Err(JobError::Lock { job, source }),
        }
    }

    /// Bring both intervals up.
    ///
    /// Minute always gets a full initialization. Day gets one too, unless
    /// `now_ms` falls within the guard band around the daily job, in which
    /// case it warm-loads from the snapshot and leaves the resync to the job.
    pub fn startup(&mut self, now_ms: i64) -> StartupReport {
        let mut errors = Vec::new();
        let minute = self.initialize(Interval::Minute, now_ms);
        let minute = settle(minute, &mut errors);

        let guard_ms = self.schedule.startup_guard_secs.saturating_mul(1000);
        let day_mode = if near_daily_trigger(now_ms, self.schedule.day_skew_ms, guard_ms) {
            DayStartup::WarmLoad
        } else {
            DayStartup::FullInitialize
        };
        let day = match day_mode {
            DayStartup::FullInitialize => {
                let day = self.initialize(Interval::Day, now_ms);
                settle(day, &mut errors)
            }
            DayStartup::WarmLoad => {
                info!("inside daily guard band, warm-loading day windows");
                Some(self.warm_start(Interval::Day, now_ms))
            }
        };

        StartupReport {
            minute,
            day,
            day_mode,
            errors,
        }
    }

    /// Full initialization of `interval` under its job lock, then flush.
    /// `Ok(None)` when another worker holds the lock.
    pub fn initialize(
        &mut self,
        interval: Interval,
        now_ms: i64,
    ) -> Result<Option<SyncReport>, JobError> {
        let _permit = match self.acquire(interval)? {
            JobPermit::Contended => {
                warn!(%interval, "initialization skipped, job lock held elsewhere");
                return Ok(None);
            }
            permit => permit,
        };
        let report = self.windows.full_initialize(
            self.source.as_ref(),
            &self.snapshots,
            &self.symbols,
            interval,
            true,
            now_ms,
        );
        info!(
            %interval,
            synced = report.synced.len(),
            failed = report.failed.len(),
            "initialization done"
        );
        Ok(Some(report))
    }

    /// Hydrate `interval` from its snapshot, backfilling short windows.
    /// Used by one-shot ticks that must continue from the persisted cursor.
    pub fn warm_start(&mut self, interval: Interval, now_ms: i64) -> SyncReport {
        self.windows.load_or_backfill(
            self.source.as_ref(),
            &self.snapshots,
            &self.symbols,
            interval,
            now_ms,
        )
    }

    pub fn minute_job(&mut self, now_ms: i64) -> Result<TickReport, JobError> {
        self.run_tick(Interval::Minute, now_ms)
    }

    pub fn day_job(&mut self, now_ms: i64) -> Result<TickReport, JobError> {
        self.run_tick(Interval::Day, now_ms)
    }

    /// Fetch closed bars newer than each symbol's cursor, merge, flush.
    pub fn run_tick(&mut self, interval: Interval, now_ms: i64) -> Result<TickReport, JobError> {
        let mut report = TickReport::new(interval, now_ms);
        let _permit = match self.acquire(interval)? {
            JobPermit::Contended => {
                info!(%interval, "tick skipped, job lock held elsewhere");
                report.skipped = true;
                return Ok(report);
            }
            permit => permit,
        };

        let keep = self.windows.keep_for(interval);
        for symbol in &self.symbols {
            let key = WindowKey::new(interval, symbol);
            let cursor = self.windows.last_ts(&key);
            let Some(range) = compute_fetch_window(cursor, interval, now_ms, keep, true) else {
                report.up_to_date.push(key.symbol);
                continue;
            };
            let limit = range.bar_count(interval).clamp(1, keep);

            match self
                .source
                .fetch(&key.symbol, interval, range.start_ms, range.end_ms, limit)
            {
                Ok(bars) => {
                    report.fetched += bars.len();
                    let outcome = self.windows.merge_increment(&key, &bars);
                    report.merged.push((key.symbol, outcome));
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(%key, error = %e, "upstream unavailable, retrying next tick");
                    } else {
                        warn!(%key, error = %e, "fetch rejected, symbol skipped this tick");
                    }
                    report.failed.push((key.symbol, e));
                }
            }
        }

        report.flushed = self
            .windows
            .flush_interval(&self.snapshots, interval, &self.symbols, updated_at(now_ms))
            .map_err(|source| {
                error!(%interval, fetched = report.fetched, "tick aborted at flush");
                JobError::Flush { interval, source }
            })?;

        info!(
            %interval,
            fetched = report.fetched,
            merged = report.merged.len(),
            up_to_date = report.up_to_date.len(),
            failed = report.failed.len(),
            flushed = report.flushed,
            "tick done"
        );
        Ok(report)
    }
}

/// Keep a startup step's report, or log and record why there is none.
fn settle(
    result: Result<Option<SyncReport>, JobError>,
    errors: &mut Vec<JobError>,
) -> Option<SyncReport> {
    match result {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "initialization failed, first tick will cold-start");
            errors.push(e);
            None
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("source", &self.source.name())
            .field("symbols", &self.symbols)
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}
