//! Fire times and the single-threaded scheduler loop.
//!
//! Each interval fires shortly after its bar boundary closes: the next
//! boundary plus a per-interval skew. Due jobs run in order (minute before
//! day) on the calling thread; a stop flag ends the loop between sleeps.

use crate::orchestrator::Orchestrator;
use chrono::Utc;
use klinecache_core::config::ScheduleConfig;
use klinecache_core::domain::Interval;
use klinecache_core::window::floor_bar_start;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info};

/// Longest single sleep, so the stop flag is noticed promptly.
const MAX_NAP: Duration = Duration::from_millis(500);

/// Next instant strictly after `now_ms` at which `interval`'s job fires.
pub fn next_fire(now_ms: i64, interval: Interval, skew_ms: u64) -> i64 {
    let step = interval.step_ms();
    let skew = i64::try_from(skew_ms).unwrap_or(i64::MAX).min(step - 1);
    let fire = floor_bar_start(now_ms, interval) + skew;
    if fire > now_ms {
        fire
    } else {
        fire + step
    }
}

/// True when `now_ms` is within `guard_ms` of a daily trigger, before or after.
pub fn near_daily_trigger(now_ms: i64, day_skew_ms: u64, guard_ms: u64) -> bool {
    let step = Interval::Day.step_ms();
    let guard = i64::try_from(guard_ms).unwrap_or(i64::MAX);
    let next = next_fire(now_ms, Interval::Day, day_skew_ms);
    let prev = next - step;
    next - now_ms <= guard || now_ms - prev <= guard
}

/// Time source for the scheduler.
pub trait Clock: Send {
    fn now_ms(&self) -> i64;
    fn sleep(&self, d: Duration);
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Counters for one scheduler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub minute_ticks: u64,
    pub day_ticks: u64,
    /// Ticks skipped because another worker held the job lock.
    pub skipped_ticks: u64,
    pub failed_ticks: u64,
}

pub struct Scheduler<C: Clock = SystemClock> {
    clock: C,
    schedule: ScheduleConfig,
}

impl Scheduler<SystemClock> {
    pub fn new(schedule: ScheduleConfig) -> Self {
        Self::with_clock(SystemClock, schedule)
    }
}

impl<C: Clock> Scheduler<C> {
    pub fn with_clock(clock: C, schedule: ScheduleConfig) -> Self {
        Self { clock, schedule }
    }

    /// Drive `orchestrator` until `stop` is set.
    ///
    /// A failed tick is logged and counted; the next scheduled tick is the retry.
    pub fn run(&self, orchestrator: &mut Orchestrator, stop: &AtomicBool) -> RunStats {
        let mut stats = RunStats::default();
        let start = self.clock.now_ms();
        let mut due: Vec<(Interval, i64)> = Interval::ALL
            .iter()
            .map(|&iv| (iv, next_fire(start, iv, self.schedule.skew_ms(iv))))
            .collect();
        for (interval, at) in &due {
            info!(%interval, fire_at = at, "scheduled");
        }

        while !stop.load(Ordering::Relaxed) {
            let now = self.clock.now_ms();
            let earliest = due.iter().map(|(_, at)| *at).min().unwrap_or(now);
            if now < earliest {
                let wait = Duration::from_millis(u64::try_from(earliest - now).unwrap_or(0));
                self.clock.sleep(wait.min(MAX_NAP));
                continue;
            }

            for (interval, at) in due.iter_mut() {
                if *at > now {
                    continue;
                }
                match orchestrator.run_tick(*interval, now) {
                    Ok(report) if report.skipped => stats.skipped_ticks += 1,
                    Ok(_) => match interval {
                        Interval::Minute => stats.minute_ticks += 1,
                        Interval::Day => stats.day_ticks += 1,
                    },
                    Err(e) => {
                        error!(%interval, error = %e, "tick aborted");
                        stats.failed_ticks += 1;
                    }
                }
                // a slow job skips missed boundaries instead of bunching up
                *at = next_fire(self.clock.now_ms().max(now), *interval, self.schedule.skew_ms(*interval));
            }
        }

        info!(?stats, "scheduler stopped");
        stats
    }
}
