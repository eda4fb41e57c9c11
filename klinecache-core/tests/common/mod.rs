//! Shared fakes for the core integration tests.

#![allow(dead_code)]

use klinecache_core::data::{BarSource, FetchError, Page, PageSource};
use klinecache_core::domain::{Bar, Interval};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

/// 2023-11-14T22:13:20.123Z
pub const T: i64 = 1_700_000_000_123;

pub fn symbols(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Deterministic bar for a start time, so re-fetches are byte-identical.
pub fn bar_at(start_ms: i64) -> Bar {
    let base = 100.0 + (start_ms / 60_000 % 500) as f64 * 0.25;
    Bar::new(start_ms / 1000, base, base + 1.0, base - 1.0, base + 0.5)
}

/// Recorded request.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub symbol: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub limit: usize,
}

/// Upstream holding a contiguous history per symbol, newest bar included
/// (it may still be forming). Symbols in `rejected` fail permanently.
pub struct FakeUpstream {
    interval: Interval,
    history: BTreeMap<String, (i64, i64)>,
    rejected: BTreeSet<String>,
    calls: Mutex<Vec<Call>>,
}

impl FakeUpstream {
    pub fn new(interval: Interval) -> Self {
        Self {
            interval,
            history: BTreeMap::new(),
            rejected: BTreeSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Bars from `first_ms` through `last_ms` inclusive.
    pub fn with_history(mut self, symbol: &str, first_ms: i64, last_ms: i64) -> Self {
        self.history.insert(symbol.to_string(), (first_ms, last_ms));
        self
    }

    pub fn rejecting(mut self, symbol: &str) -> Self {
        self.rejected.insert(symbol.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn range(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Vec<Bar> {
        let step = self.interval.step_ms();
        let Some((first, last)) = self.history.get(symbol) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut t = *first;
        while t <= *last {
            if t >= start_ms && t <= end_ms {
                out.push(bar_at(t));
            }
            t += step;
        }
        out
    }

    fn record(&self, symbol: &str, start_ms: i64, end_ms: i64, limit: usize) -> Result<(), FetchError> {
        self.calls.lock().unwrap().push(Call {
            symbol: symbol.to_string(),
            start_ms,
            end_ms,
            limit,
        });
        if self.rejected.contains(symbol) {
            return Err(FetchError::Permanent {
                symbol: symbol.to_string(),
                status: 403,
                message: "forbidden".into(),
            });
        }
        Ok(())
    }
}

impl BarSource for FakeUpstream {
    fn name(&self) -> &str {
        "fake"
    }

    fn fetch(
        &self,
        symbol: &str,
        _interval: Interval,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<Bar>, FetchError> {
        self.record(symbol, start_ms, end_ms, limit)?;
        let mut bars = self.range(symbol, start_ms, end_ms);
        if bars.len() > limit {
            bars.drain(..bars.len() - limit);
        }
        Ok(bars)
    }
}

impl PageSource for FakeUpstream {
    fn name(&self) -> &str {
        "fake-pages"
    }

    fn fetch_page(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Page, FetchError> {
        let bars = BarSource::fetch(self, symbol, interval, start_ms, end_ms, limit)?;
        Ok(Page {
            bars,
            attempts: 1,
            dropped: 0,
        })
    }
}
