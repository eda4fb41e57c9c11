//! Bounded in-memory windows of closed bars, one per `(interval, symbol)`.
//!
//! The store owns every window. Windows are created on first access and
//! never removed. Each window holds at most `keep[interval]` bars in strictly
//! ascending timestamp order; merges are idempotent and commutative up to the
//! capacity bound.

use super::math::compute_fetch_window;
use crate::config::KeepConfig;
use crate::data::{BarSource, FetchError};
use crate::domain::{Bar, Interval, WindowKey};
use crate::persist::{PersistError, SnapshotStore};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Created but never populated from upstream or a snapshot.
    Uninitialized,
    Hydrated,
}

/// Counts from one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Timestamps not previously in the window.
    pub inserted: usize,
    /// Known timestamps whose bar was replaced.
    pub overwritten: usize,
    /// Oldest bars dropped to respect the capacity.
    pub evicted: usize,
}

#[derive(Debug, Clone)]
pub struct Window {
    bars: VecDeque<Bar>,
    capacity: usize,
    state: WindowState,
}

impl Window {
    pub fn new(capacity: usize) -> Self {
        Self {
            bars: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            state: WindowState::Uninitialized,
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    pub fn is_hydrated(&self) -> bool {
        self.state == WindowState::Hydrated
    }

    pub fn to_vec(&self) -> Vec<Bar> {
        self.bars.iter().copied().collect()
    }

    /// Newest bar start in seconds.
    pub fn last_ts(&self) -> Option<i64> {
        self.bars.back().map(|b| b.timestamp)
    }

    /// Change capacity, keeping the newest bars.
    fn resize(&mut self, capacity: usize) {
        let excess = self.bars.len().saturating_sub(capacity);
        self.bars.drain(..excess);
        self.capacity = capacity;
    }

    /// Replace the contents entirely and mark the window hydrated.
    pub fn replace(&mut self, bars: Vec<Bar>) {
        let by_time: BTreeMap<i64, Bar> = bars.into_iter().map(|b| (b.timestamp, b)).collect();
        self.bars = newest(by_time, self.capacity);
        self.state = WindowState::Hydrated;
    }

    /// Upsert `incoming` by timestamp (latest write wins) and keep the newest
    /// `capacity` bars. A non-empty merge hydrates the window.
    pub fn merge(&mut self, incoming: &[Bar]) -> MergeOutcome {
        if incoming.is_empty() {
            return MergeOutcome::default();
        }
        let before = self.bars.len();
        let mut by_time: BTreeMap<i64, Bar> =
            self.bars.drain(..).map(|b| (b.timestamp, b)).collect();

        for bar in incoming {
            by_time.insert(bar.timestamp, *bar);
        }
        let combined = by_time.len();
        self.bars = newest(by_time, self.capacity);
        self.state = WindowState::Hydrated;

        // a timestamp repeated within the batch counts as an overwrite
        let inserted = combined - before;
        MergeOutcome {
            inserted,
            overwritten: incoming.len() - inserted,
            evicted: combined - self.bars.len(),
        }
    }
}

fn newest(by_time: BTreeMap<i64, Bar>, capacity: usize) -> VecDeque<Bar> {
    let skip = by_time.len().saturating_sub(capacity);
    by_time.into_values().skip(skip).collect()
}

/// Why one symbol did not sync.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Per-symbol outcome of a batch operation over one interval.
#[derive(Debug)]
pub struct SyncReport {
    pub interval: Interval,
    /// Symbols populated, with the window length afterwards.
    pub synced: Vec<(String, usize)>,
    /// Symbols that needed an upstream fetch during warm start.
    pub backfilled: Vec<String>,
    pub failed: Vec<(String, SyncError)>,
    /// Outcome of the flush, when the operation flushes.
    pub flush: Option<Result<usize, PersistError>>,
}

impl SyncReport {
    fn new(interval: Interval) -> Self {
        Self {
            interval,
            synced: Vec::new(),
            backfilled: Vec::new(),
            failed: Vec::new(),
            flush: None,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && !matches!(self.flush, Some(Err(_)))
    }

    pub fn window_len(&self, symbol: &str) -> Option<usize> {
        self.synced
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, n)| *n)
    }
}

/// Owner of every window.
#[derive(Debug)]
pub struct WindowStore {
    keep: KeepConfig,
    windows: BTreeMap<WindowKey, Window>,
}

impl WindowStore {
    pub fn new(keep: KeepConfig) -> Self {
        Self {
            keep,
            windows: BTreeMap::new(),
        }
    }

    pub fn keep_for(&self, interval: Interval) -> usize {
        self.keep.for_interval(interval)
    }

    /// Change the capacity for `interval`. Windows resize on their next access.
    pub fn set_keep(&mut self, interval: Interval, keep: usize) {
        self.keep.set(interval, keep.max(1));
    }

    /// The window for `key`, created empty if absent and resized if the
    /// configured capacity changed since it was created.
    pub fn ensure(&mut self, key: &WindowKey) -> &mut Window {
        let need = self.keep.for_interval(key.interval);
        let window = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| Window::new(need));
        if window.capacity != need {
            debug!(%key, from = window.capacity, to = need, "resizing window");
            window.resize(need);
        }
        window
    }

    /// Copy of the window's bars, oldest first.
    pub fn bars(&self, key: &WindowKey) -> Vec<Bar> {
        self.windows.get(key).map(Window::to_vec).unwrap_or_default()
    }

    /// Newest bar start in seconds; the cursor for the next incremental fetch.
    pub fn last_ts(&self, key: &WindowKey) -> Option<i64> {
        self.windows.get(key).and_then(Window::last_ts)
    }

    pub fn merge_increment(&mut self, key: &WindowKey, bars: &[Bar]) -> MergeOutcome {
        self.ensure(key).merge(bars)
    }

    /// Fetch a full window of `keep` bars per symbol, replace the contents,
    /// then flush the interval.
    ///
    /// A symbol whose fetch fails keeps its previous state and is reported;
    /// the remaining symbols still initialize.
    pub fn full_initialize(
        &mut self,
        source: &dyn BarSource,
        snapshots: &SnapshotStore,
        symbols: &[String],
        interval: Interval,
        exclude_open: bool,
        now_ms: i64,
    ) -> SyncReport {
        let keep = self.keep_for(interval);
        let mut report = SyncReport::new(interval);

        match compute_fetch_window(None, interval, now_ms, keep, exclude_open) {
            Some(range) => {
                for symbol in symbols {
                    let key = WindowKey::new(interval, symbol);
                    match source.fetch(&key.symbol, interval, range.start_ms, range.end_ms, keep) {
                        Ok(bars) => {
                            let window = self.ensure(&key);
                            window.replace(bars);
                            info!(%key, bars = window.len(), keep, "window initialized");
                            report.synced.push((key.symbol, window.len()));
                        }
                        Err(e) => {
                            warn!(%key, error = %e, "initialization failed, keeping previous state");
                            report.failed.push((key.symbol, e.into()));
                        }
                    }
                }
            }
            None => warn!(%interval, "empty initialization range"),
        }

        report.flush = Some(self.flush_interval(snapshots, interval, symbols, updated_at(now_ms)));
        report
    }

    /// Warm start: hydrate each symbol from its persisted snapshot and
    /// backfill from upstream when the snapshot holds fewer than `keep` bars.
    ///
    /// A corrupt or unreadable snapshot counts as absent. Backfill requests
    /// closed bars only and merges into what was hydrated. Does not flush.
    pub fn load_or_backfill(
        &mut self,
        source: &dyn BarSource,
        snapshots: &SnapshotStore,
        symbols: &[String],
        interval: Interval,
        now_ms: i64,
    ) -> SyncReport {
        let keep = self.keep_for(interval);
        let mut report = SyncReport::new(interval);

        let mut stored = match snapshots.load_windows(symbols, interval) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(%interval, error = %e, "snapshot unreadable, backfilling every symbol");
                BTreeMap::new()
            }
        };

        for symbol in symbols {
            let key = WindowKey::new(interval, symbol);
            let recovered = match stored.remove(symbol) {
                Some(Ok(w)) => w.bars,
                Some(Err(e)) => {
                    warn!(%key, error = %e, "ignoring corrupt snapshot entry");
                    Vec::new()
                }
                None => Vec::new(),
            };

            let window = self.ensure(&key);
            if !recovered.is_empty() {
                window.replace(recovered);
                info!(%key, bars = window.len(), "loaded from snapshot");
            }
            if window.len() >= keep {
                report.synced.push((key.symbol, window.len()));
                continue;
            }

            let Some(range) = compute_fetch_window(None, interval, now_ms, keep, true) else {
                report.synced.push((key.symbol, window.len()));
                continue;
            };
            match source.fetch(&key.symbol, interval, range.start_ms, range.end_ms, keep) {
                Ok(bars) => {
                    // mark hydrated even when upstream has nothing
                    if bars.is_empty() && !window.is_hydrated() {
                        window.replace(Vec::new());
                    }
                    window.merge(&bars);
                    info!(%key, fetched = bars.len(), bars = window.len(), "backfilled from upstream");
                    report.backfilled.push(key.symbol.clone());
                    report.synced.push((key.symbol, window.len()));
                }
                Err(e) => {
                    warn!(%key, error = %e, hydrated = window.len(), "backfill failed");
                    if window.is_hydrated() {
                        report.synced.push((key.symbol.clone(), window.len()));
                    }
                    report.failed.push((key.symbol, e.into()));
                }
            }
        }
        report
    }

    /// Persist every hydrated window of `interval` among `symbols` in one
    /// batched write. Uninitialized windows are left out so a failed
    /// initialization never overwrites a good snapshot with an empty one.
    pub fn flush_interval(
        &mut self,
        snapshots: &SnapshotStore,
        interval: Interval,
        symbols: &[String],
        updated_at: DateTime<Utc>,
    ) -> Result<usize, PersistError> {
        let keys: Vec<WindowKey> = symbols.iter().map(|s| WindowKey::new(interval, s)).collect();
        for key in &keys {
            self.ensure(key);
        }

        let batch: Vec<(&str, Vec<Bar>)> = keys
            .iter()
            .filter_map(|key| {
                let window = self.windows.get(key)?;
                window
                    .is_hydrated()
                    .then(|| (key.symbol.as_str(), window.to_vec()))
            })
            .collect();
        if batch.is_empty() {
            debug!(%interval, "no hydrated windows to flush");
            return Ok(0);
        }

        match snapshots.flush(
            interval,
            batch.iter().map(|(s, bars)| (*s, bars.as_slice())),
            updated_at,
        ) {
            Ok(n) => {
                debug!(%interval, symbols = n, "interval flushed");
                Ok(n)
            }
            Err(e) => {
                error!(%interval, error = %e, "flush failed; windows stay in memory");
                Err(e)
            }
        }
    }
}

/// Flush timestamp for a tick at `now_ms`.
pub fn updated_at(now_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(now_ms).unwrap_or_default()
}
