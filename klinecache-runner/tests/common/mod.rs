//! Shared fakes for the runner integration tests.

#![allow(dead_code)]

use klinecache_core::config::{KeepConfig, ScheduleConfig};
use klinecache_core::data::{BarSource, FetchError};
use klinecache_core::domain::{Bar, Interval};
use klinecache_core::persist::{BarCodec, KvStore, MemoryKv, PersistError, SnapshotStore};
use klinecache_core::window::WindowStore;
use klinecache_runner::{Clock, Orchestrator};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MIN: i64 = 60_000;
pub const DAY: i64 = 86_400_000;
/// 2024-03-01T00:00:00Z
pub const MIDNIGHT: i64 = 1_709_251_200_000;

pub fn symbols(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

pub fn bar_at(start_ms: i64) -> Bar {
    let base = 50.0 + (start_ms / MIN % 97) as f64;
    Bar::new(start_ms / 1000, base, base + 2.0, base - 2.0, base + 1.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub symbol: String,
    pub interval: Interval,
    pub start_ms: i64,
    pub end_ms: i64,
    pub limit: usize,
}

/// Upstream with a contiguous minute and day history for every symbol
/// between `first_ms` and `last_ms`. Clones share the call log.
#[derive(Clone)]
pub struct FakeUpstream {
    first_ms: i64,
    last_ms: i64,
    rejected: BTreeSet<String>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl FakeUpstream {
    pub fn new(first_ms: i64, last_ms: i64) -> Self {
        Self {
            first_ms,
            last_ms,
            rejected: BTreeSet::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn rejecting(mut self, symbol: &str) -> Self {
        self.rejected.insert(symbol.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, interval: Interval) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.interval == interval)
            .collect()
    }
}

impl BarSource for FakeUpstream {
    fn name(&self) -> &str {
        "fake"
    }

    fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<Bar>, FetchError> {
        self.calls.lock().unwrap().push(Call {
            symbol: symbol.to_string(),
            interval,
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
        let step = interval.step_ms();
        let lo = start_ms.max(self.first_ms);
        let hi = end_ms.min(self.last_ms);
        let mut t = lo.div_euclid(step) * step;
        if t < lo {
            t += step;
        }
        let mut bars = Vec::new();
        while t <= hi {
            bars.push(bar_at(t));
            t += step;
        }
        if bars.len() > limit {
            bars.drain(..bars.len() - limit);
        }
        Ok(bars)
    }
}

/// Store whose hash writes always fail.
#[derive(Default)]
pub struct ReadOnlyKv {
    inner: MemoryKv,
}

impl KvStore for ReadOnlyKv {
    fn hset_multi(&self, _key: &str, _fields: &[(String, String)]) -> Result<(), PersistError> {
        Err(PersistError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only store",
        )))
    }

    fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, PersistError> {
        self.inner.hmget(key, fields)
    }

    fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, PersistError> {
        self.inner.hgetall(key)
    }

    fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, PersistError> {
        self.inner.set_nx_px(key, value, ttl)
    }

    fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, PersistError> {
        self.inner.del_if_eq(key, value)
    }
}

/// Store whose first `failures` lock requests fail at the backend.
pub struct FlakyLockKv {
    inner: MemoryKv,
    failures: AtomicUsize,
}

impl FlakyLockKv {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: MemoryKv::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

impl KvStore for FlakyLockKv {
    fn hset_multi(&self, key: &str, fields: &[(String, String)]) -> Result<(), PersistError> {
        self.inner.hset_multi(key, fields)
    }

    fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, PersistError> {
        self.inner.hmget(key, fields)
    }

    fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, PersistError> {
        self.inner.hgetall(key)
    }

    fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, PersistError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PersistError::Backend("lock store unreachable".into()));
        }
        self.inner.set_nx_px(key, value, ttl)
    }

    fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, PersistError> {
        self.inner.del_if_eq(key, value)
    }
}

pub fn orchestrator(
    upstream: &FakeUpstream,
    kv: Arc<dyn KvStore>,
    names: &[&str],
    keep: usize,
) -> Orchestrator {
    Orchestrator::new(
        WindowStore::new(KeepConfig {
            minute: keep,
            day: keep,
        }),
        Box::new(upstream.clone()),
        SnapshotStore::new(kv, BarCodec::default()),
        symbols(names),
        ScheduleConfig::default(),
    )
}

pub fn memory_kv() -> Arc<dyn KvStore> {
    Arc::new(MemoryKv::new())
}

/// Clock that advances only when slept on, and raises `stop` once it
/// reaches `stop_at`.
pub struct FakeClock {
    now: AtomicI64,
    stop_at: i64,
    stop: Arc<AtomicBool>,
}

impl FakeClock {
    pub fn new(start_ms: i64, stop_at: i64, stop: Arc<AtomicBool>) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
            stop_at,
            stop,
        }
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, d: Duration) {
        let ms = i64::try_from(d.as_millis()).unwrap();
        let now = self.now.fetch_add(ms, Ordering::SeqCst) + ms;
        if now >= self.stop_at {
            self.stop.store(true, Ordering::SeqCst);
        }
    }
}
