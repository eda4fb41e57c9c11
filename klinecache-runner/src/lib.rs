//! Klinecache Runner: jobs that keep kline windows current.
//!
//! This crate builds on `klinecache-core` to provide:
//! - Startup routine (full initialization, warm load near the daily job)
//! - Minute and day ticks: closed-bar increments, merge, snapshot flush
//! - Best-effort job lock over the key-value store
//! - Single-threaded scheduler with per-interval skew and a stop flag

pub mod lock;
pub mod orchestrator;
pub mod schedule;

pub use lock::{lock_key, JobLock, LockGuard};
pub use orchestrator::{DayStartup, JobError, Orchestrator, StartupReport, TickReport};
pub use schedule::{near_daily_trigger, next_fire, Clock, RunStats, Scheduler, SystemClock};
