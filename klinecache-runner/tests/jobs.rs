//! Startup routine and minute/day ticks against a fake upstream.

mod common;

use common::{
    bar_at, memory_kv, orchestrator, FakeUpstream, FlakyLockKv, ReadOnlyKv, DAY, MIDNIGHT, MIN,
};
use klinecache_core::domain::{Interval, WindowKey};
use klinecache_core::persist::{BarCodec, KvStore, SnapshotStore};
use klinecache_runner::{DayStartup, JobError, JobLock};
use std::sync::Arc;
use std::time::Duration;

/// 10:00:20.123 UTC, far from the daily job.
const MORNING: i64 = MIDNIGHT + 10 * 3_600_000 + 20_123;
const KEEP: usize = 50;

fn history() -> FakeUpstream {
    FakeUpstream::new(MIDNIGHT - 400 * DAY, MIDNIGHT + DAY)
}

fn btc(interval: Interval) -> WindowKey {
    WindowKey::new(interval, "BTCUSDT")
}

#[test]
fn startup_then_minute_ticks_append_closed_bars() {
    let upstream = history();
    let mut orch = orchestrator(&upstream, memory_kv(), &["BTCUSDT"], KEEP);

    let startup = orch.startup(MORNING);
    assert_eq!(startup.day_mode, DayStartup::FullInitialize);
    assert_eq!(startup.minute.unwrap().window_len("BTCUSDT"), Some(KEEP));
    assert_eq!(startup.day.unwrap().window_len("BTCUSDT"), Some(KEEP));

    let open_minute = MIDNIGHT + 10 * 3_600_000;
    assert_eq!(orch.windows().last_ts(&btc(Interval::Minute)), Some((open_minute - MIN) / 1000));
    assert_eq!(orch.windows().last_ts(&btc(Interval::Day)), Some((MIDNIGHT - DAY) / 1000));

    let tick = orch.minute_job(MORNING + MIN).unwrap();
    assert!(!tick.skipped);
    assert_eq!(tick.fetched, 1);
    assert_eq!(tick.merged.len(), 1);
    assert_eq!(tick.merged[0].1.inserted, 1);
    assert_eq!(tick.merged[0].1.evicted, 1);
    assert_eq!(tick.flushed, 1);

    let last_call = upstream.calls_for(Interval::Minute).pop().unwrap();
    assert_eq!(last_call.start_ms, open_minute);
    assert_eq!(last_call.end_ms, open_minute + MIN - 1);
    assert_eq!(last_call.limit, 1);

    // same minute again: nothing new, snapshot still rewritten
    let again = orch.minute_job(MORNING + MIN + 5_000).unwrap();
    assert_eq!(again.up_to_date, vec!["BTCUSDT".to_string()]);
    assert_eq!(again.fetched, 0);
    assert_eq!(again.flushed, 1);

    let stored = orch
        .snapshots()
        .load_window("BTCUSDT", Interval::Minute)
        .unwrap();
    assert_eq!(stored.bars.len(), KEEP);
    assert_eq!(stored.last_ts, Some(open_minute / 1000));
}

#[test]
fn startup_near_daily_job_warm_loads_day_windows() {
    let upstream = history();
    let kv = memory_kv();
    // 23:59:02 the day before: 60 s ahead of the 00:00:02 trigger
    let now = MIDNIGHT + 2_000 - 60_000;

    let day_bars: Vec<_> = (0..KEEP as i64)
        .rev()
        .map(|i| bar_at(MIDNIGHT - 2 * DAY - i * DAY))
        .collect();
    SnapshotStore::new(kv.clone(), BarCodec::default())
        .flush(
            Interval::Day,
            [("BTCUSDT", day_bars.as_slice())],
            klinecache_core::window::updated_at(now - DAY),
        )
        .unwrap();

    let mut orch = orchestrator(&upstream, kv, &["BTCUSDT"], KEEP);
    let startup = orch.startup(now);
    assert_eq!(startup.day_mode, DayStartup::WarmLoad);
    assert!(startup.day.unwrap().backfilled.is_empty());
    assert!(upstream.calls_for(Interval::Day).is_empty());
    assert_eq!(orch.windows().bars(&btc(Interval::Day)), day_bars);

    // the scheduled day job then picks up the bar that just closed
    let tick = orch.day_job(MIDNIGHT + 2_000).unwrap();
    assert_eq!(tick.fetched, 1);
    let call = upstream.calls_for(Interval::Day).pop().unwrap();
    assert_eq!(call.start_ms, MIDNIGHT - DAY);
    assert_eq!(call.end_ms, MIDNIGHT - 1);
    assert_eq!(orch.windows().last_ts(&btc(Interval::Day)), Some((MIDNIGHT - DAY) / 1000));
}

#[test]
fn contended_lock_skips_the_tick() {
    let upstream = history();
    let kv = memory_kv();
    let lock = JobLock::new(kv.clone(), Duration::from_secs(300));
    let mut orch = orchestrator(&upstream, kv.clone(), &["BTCUSDT"], KEEP).with_lock(lock);

    let other = JobLock::new(kv, Duration::from_secs(300));
    let held = other.try_acquire("1").unwrap().expect("other worker holds minute job");

    let tick = orch.minute_job(MORNING).unwrap();
    assert!(tick.skipped);
    assert!(upstream.calls().is_empty());

    // the day job has its own lock
    let day = orch.day_job(MORNING).unwrap();
    assert!(!day.skipped);
    assert_eq!(upstream.calls_for(Interval::Day).len(), 1);

    drop(held);
    let tick = orch.minute_job(MORNING).unwrap();
    assert!(!tick.skipped);
    assert_eq!(tick.merged.len(), 1);
    // released after the tick
    assert!(other.try_acquire("1").unwrap().is_some());
}

#[test]
fn lock_store_outage_at_startup_is_not_fatal() {
    let upstream = history();
    let kv: Arc<dyn KvStore> = Arc::new(FlakyLockKv::new(2));
    let lock = JobLock::new(kv.clone(), Duration::from_secs(300));
    let mut orch = orchestrator(&upstream, kv, &["BTCUSDT"], KEEP).with_lock(lock);

    let startup = orch.startup(MORNING);
    assert!(startup.minute.is_none());
    assert!(startup.day.is_none());
    assert_eq!(startup.errors.len(), 2);
    assert!(startup
        .errors
        .iter()
        .all(|e| matches!(e, JobError::Lock { .. })));
    assert!(upstream.calls().is_empty());

    // the store is back: the first tick cold-starts a full window
    let tick = orch.minute_job(MORNING + MIN).unwrap();
    assert!(!tick.skipped);
    assert_eq!(tick.fetched, KEEP);
    assert_eq!(tick.flushed, 1);
    assert_eq!(orch.windows().bars(&btc(Interval::Minute)).len(), KEEP);
}

#[test]
fn initialize_respects_a_held_lock() {
    let upstream = history();
    let kv = memory_kv();
    let lock = JobLock::new(kv.clone(), Duration::from_secs(300));
    let mut orch = orchestrator(&upstream, kv.clone(), &["BTCUSDT"], KEEP).with_lock(lock);

    let daemon = JobLock::new(kv, Duration::from_secs(300));
    let held = daemon.try_acquire("D").unwrap().expect("daemon holds the day job");
    assert!(orch.initialize(Interval::Day, MORNING).unwrap().is_none());
    assert!(upstream.calls().is_empty());

    drop(held);
    let report = orch.initialize(Interval::Day, MORNING).unwrap().expect("lock is free");
    assert_eq!(report.window_len("BTCUSDT"), Some(KEEP));
    assert!(matches!(report.flush, Some(Ok(1))));
}

#[test]
fn permanent_failure_is_isolated_per_symbol() {
    let upstream = history().rejecting("ETHUSDT");
    let mut orch = orchestrator(&upstream, memory_kv(), &["BTCUSDT", "ETHUSDT"], KEEP);

    let startup = orch.startup(MORNING);
    let minute = startup.minute.unwrap();
    assert_eq!(minute.window_len("BTCUSDT"), Some(KEEP));
    assert_eq!(minute.failed.len(), 1);

    let tick = orch.minute_job(MORNING + MIN).unwrap();
    assert_eq!(tick.merged.len(), 1);
    assert_eq!(tick.merged[0].0, "BTCUSDT");
    assert_eq!(tick.failed.len(), 1);
    assert_eq!(tick.failed[0].0, "ETHUSDT");
    assert!(tick.failed[0].1.is_permanent());
    assert_eq!(tick.flushed, 1);

    let meta = orch.snapshots().snapshot_meta(Interval::Minute).unwrap();
    assert!(!meta.symbols.contains_key("ETHUSDT"));
}

#[test]
fn flush_failure_aborts_the_tick_but_keeps_memory_state() {
    let upstream = history();
    let kv: Arc<dyn KvStore> = Arc::new(ReadOnlyKv::default());
    let mut orch = orchestrator(&upstream, kv, &["BTCUSDT"], KEEP);

    let startup = orch.startup(MORNING);
    assert!(matches!(startup.minute.unwrap().flush, Some(Err(_))));

    let err = orch.minute_job(MORNING + MIN).unwrap_err();
    assert!(matches!(err, JobError::Flush { interval: Interval::Minute, .. }));
    assert_eq!(
        orch.windows().last_ts(&btc(Interval::Minute)),
        Some((MIDNIGHT + 10 * 3_600_000) / 1000)
    );
}

#[test]
fn restart_continues_from_the_flushed_cursor() {
    let upstream = history();
    let kv = memory_kv();
    {
        let mut first = orchestrator(&upstream, kv.clone(), &["BTCUSDT"], KEEP);
        first.startup(MORNING);
        first.minute_job(MORNING + MIN).unwrap();
    }

    let restarted_upstream = history();
    let mut second = orchestrator(&restarted_upstream, kv, &["BTCUSDT"], KEEP);
    let warm = second.warm_start(Interval::Minute, MORNING + 3 * MIN);
    assert_eq!(warm.window_len("BTCUSDT"), Some(KEEP));
    assert!(restarted_upstream.calls().is_empty());

    let tick = second.minute_job(MORNING + 3 * MIN).unwrap();
    assert_eq!(tick.fetched, 2);
    let call = &restarted_upstream.calls()[0];
    assert_eq!(call.start_ms, MIDNIGHT + 10 * 3_600_000 + MIN);
    assert_eq!(call.end_ms, MIDNIGHT + 10 * 3_600_000 + 3 * MIN - 1);
}
