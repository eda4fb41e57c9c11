//! Bar-boundary arithmetic. Pure functions, no I/O.
//!
//! All instants are epoch milliseconds except the window cursor, which is a
//! bar timestamp in epoch seconds (the unit bars are stored in).

use crate::domain::Interval;

/// Length of one bar in milliseconds.
pub fn step_ms(interval: Interval) -> i64 {
    interval.step_ms()
}

/// Start of the bar that contains `now_ms`.
pub fn floor_bar_start(now_ms: i64, interval: Interval) -> i64 {
    let step = interval.step_ms();
    now_ms.div_euclid(step) * step
}

/// Start of a window of `keep` bars whose newest bar contains `end_ms`.
pub fn window_start(end_ms: i64, interval: Interval, keep: usize) -> i64 {
    let back = keep.saturating_sub(1) as i64;
    floor_bar_start(end_ms, interval) - back * interval.step_ms()
}

/// Inclusive millisecond range to request from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRange {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl FetchRange {
    /// Number of bar starts that fall inside the range.
    pub fn bar_count(&self, interval: Interval) -> usize {
        if self.start_ms > self.end_ms {
            return 0;
        }
        let step = interval.step_ms();
        let first = self.start_ms.div_euclid(step) + i64::from(self.start_ms.rem_euclid(step) != 0);
        let last = self.end_ms.div_euclid(step);
        usize::try_from(last - first + 1).unwrap_or(0)
    }
}

/// Compute the next range to fetch for one window.
///
/// With `exclude_open` the range ends one millisecond before the bar that is
/// still forming at `now_ms`, so only closed bars are ever requested. Without
/// a cursor (`last_ts_sec == None`) the range covers `keep` bars ending at the
/// range end. Returns `None` when there is nothing new.
pub fn compute_fetch_window(
    last_ts_sec: Option<i64>,
    interval: Interval,
    now_ms: i64,
    keep: usize,
    exclude_open: bool,
) -> Option<FetchRange> {
    let end_ms = if exclude_open {
        floor_bar_start(now_ms, interval) - 1
    } else {
        now_ms
    };

    let start_ms = match last_ts_sec {
        None => window_start(end_ms, interval, keep),
        Some(last) => (last + interval.step_ms() / 1000) * 1000,
    };

    if start_ms > end_ms {
        return None;
    }
    Some(FetchRange { start_ms, end_ms })
}
