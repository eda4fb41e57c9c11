//! Backward pagination over a capped [`PageSource`].
//!
//! The walk starts at the end of the range and moves toward the start one
//! page at a time. It is an explicit loop with a page ceiling so a faulty
//! upstream (repeating the same page, returning out-of-range rows) cannot
//! keep a job busy forever.

use super::bybit::MAX_LIMIT;
use super::provider::{BarSource, FetchError, PageSource};
use crate::domain::{Bar, Interval};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Extra pages allowed beyond `ceil(limit / cap)` before giving up.
pub const PAGE_MARGIN: usize = 2;

/// Why the walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Collected the requested quantity.
    Filled,
    /// Reached the start of the range.
    Covered,
    /// Upstream returned no rows.
    EmptyPage,
    /// The oldest row did not move the cursor backward.
    NoProgress,
    /// Hit the page ceiling.
    PageCeiling,
}

/// Bars collected by one walk, plus bookkeeping for logs and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct Walk {
    pub bars: Vec<Bar>,
    pub pages: usize,
    pub stop: StopReason,
}

/// Fetch up to `want` bars in `[start_ms, end_ms]` using pages of at most `cap`.
pub fn walk_backward(
    pages: &dyn PageSource,
    symbol: &str,
    interval: Interval,
    start_ms: i64,
    end_ms: i64,
    want: usize,
    cap: usize,
) -> Result<Walk, FetchError> {
    if want == 0 || start_ms > end_ms {
        return Ok(Walk {
            bars: Vec::new(),
            pages: 0,
            stop: StopReason::Covered,
        });
    }

    let cap = cap.clamp(1, MAX_LIMIT);
    let max_pages = want.div_ceil(cap) + PAGE_MARGIN;
    let mut acc: BTreeMap<i64, Bar> = BTreeMap::new();
    let mut cursor_end = end_ms;
    let mut used = 0;

    let stop = loop {
        if used >= max_pages {
            break StopReason::PageCeiling;
        }
        if cursor_end < start_ms {
            break StopReason::Covered;
        }

        let remaining = want - acc.len();
        let page = pages.fetch_page(symbol, interval, start_ms, cursor_end, remaining.min(cap))?;
        used += 1;

        let Some(oldest_ms) = page.bars.iter().map(Bar::start_ms).min() else {
            break StopReason::EmptyPage;
        };

        for bar in page.bars {
            let ms = bar.start_ms();
            if ms >= start_ms && ms <= end_ms {
                acc.insert(bar.timestamp, bar);
            }
        }

        if acc.len() >= want {
            break StopReason::Filled;
        }
        if oldest_ms <= start_ms {
            break StopReason::Covered;
        }
        let next_end = oldest_ms - 1;
        if next_end >= cursor_end {
            break StopReason::NoProgress;
        }
        cursor_end = next_end;
    };

    match stop {
        StopReason::PageCeiling | StopReason::NoProgress => warn!(
            symbol,
            %interval,
            pages = used,
            collected = acc.len(),
            want,
            ?stop,
            "pagination stopped early"
        ),
        _ => debug!(symbol, %interval, pages = used, collected = acc.len(), ?stop, "pagination done"),
    }

    let mut bars: Vec<Bar> = acc.into_values().collect();
    if bars.len() > want {
        bars.drain(..bars.len() - want);
    }
    Ok(Walk {
        bars,
        pages: used,
        stop,
    })
}

/// A [`BarSource`] that paginates a [`PageSource`] under a per-call cap.
pub struct PagedFetcher<P> {
    pages: P,
    per_call_cap: usize,
}

impl<P: PageSource> PagedFetcher<P> {
    pub fn new(pages: P, per_call_cap: usize) -> Self {
        Self {
            pages,
            per_call_cap: per_call_cap.clamp(1, MAX_LIMIT),
        }
    }

    pub fn pages(&self) -> &P {
        &self.pages
    }
}

impl<P: PageSource> BarSource for PagedFetcher<P> {
    fn name(&self) -> &str {
        self.pages.name()
    }

    fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<Bar>, FetchError> {
        walk_backward(
            &self.pages,
            symbol,
            interval,
            start_ms,
            end_ms,
            limit,
            self.per_call_cap,
        )
        .map(|walk| walk.bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::provider::Page;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const STEP: i64 = 60_000;

    /// Upstream holding a contiguous minute history, newest `limit` per call.
    struct History {
        first_ms: i64,
        count: i64,
        calls: AtomicUsize,
    }

    impl History {
        fn new(first_ms: i64, count: i64) -> Self {
            Self {
                first_ms,
                count,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl PageSource for History {
        fn name(&self) -> &str {
            "history"
        }

        fn fetch_page(
            &self,
            _symbol: &str,
            _interval: Interval,
            start_ms: i64,
            end_ms: i64,
            limit: usize,
        ) -> Result<Page, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut bars: Vec<Bar> = (0..self.count)
                .map(|i| self.first_ms + i * STEP)
                .filter(|ms| *ms >= start_ms && *ms <= end_ms)
                .map(|ms| Bar::new(ms / 1000, 1.0, 1.0, 1.0, 1.0))
                .collect();
            if bars.len() > limit {
                bars.drain(..bars.len() - limit);
            }
            Ok(Page {
                bars,
                attempts: 1,
                dropped: 0,
            })
        }
    }

    /// Misbehaving upstream: always returns the same single bar.
    struct Stuck {
        calls: AtomicUsize,
    }

    impl PageSource for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        fn fetch_page(
            &self,
            _symbol: &str,
            _interval: Interval,
            _start_ms: i64,
            end_ms: i64,
            _limit: usize,
        ) -> Result<Page, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // claims a bar far in the future so the cursor never moves
            Ok(Page {
                bars: vec![Bar::new((end_ms + 10 * STEP) / 1000, 1.0, 1.0, 1.0, 1.0)],
                attempts: 1,
                dropped: 0,
            })
        }
    }

    #[test]
    fn walks_backward_across_pages() {
        let up = History::new(0, 2500);
        let end = 2499 * STEP;
        let walk = walk_backward(&up, "X", Interval::Minute, 0, end, 2500, 1000).unwrap();
        assert_eq!(walk.bars.len(), 2500);
        assert_eq!(walk.pages, 3);
        assert_eq!(walk.stop, StopReason::Filled);
        assert!(walk.bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn keeps_most_recent_when_range_is_larger_than_want() {
        let up = History::new(0, 500);
        let walk = walk_backward(&up, "X", Interval::Minute, 0, 499 * STEP, 120, 50).unwrap();
        assert_eq!(walk.bars.len(), 120);
        assert_eq!(walk.bars.last().unwrap().start_ms(), 499 * STEP);
        assert_eq!(walk.bars[0].start_ms(), 380 * STEP);
        assert_eq!(walk.pages, 3);
    }

    #[test]
    fn short_history_stops_on_empty_page() {
        // upstream only has the newest 250 of a 300-bar range
        let up = History::new(50 * STEP, 250);
        let walk = walk_backward(&up, "X", Interval::Minute, 0, 299 * STEP, 300, 100).unwrap();
        assert_eq!(walk.bars.len(), 250);
        assert_eq!(walk.stop, StopReason::EmptyPage);
    }

    #[test]
    fn stuck_upstream_hits_no_progress_guard() {
        let up = Stuck {
            calls: AtomicUsize::new(0),
        };
        let walk = walk_backward(&up, "X", Interval::Minute, 0, 100 * STEP, 100, 10).unwrap();
        assert!(walk.bars.is_empty());
        assert_eq!(walk.stop, StopReason::NoProgress);
        assert_eq!(up.calls.load(Ordering::SeqCst), 1);
    }

    /// Upstream that ignores `limit` and hands out one bar per call.
    struct Trickle {
        calls: AtomicUsize,
    }

    impl PageSource for Trickle {
        fn name(&self) -> &str {
            "trickle"
        }

        fn fetch_page(
            &self,
            _symbol: &str,
            _interval: Interval,
            _start_ms: i64,
            end_ms: i64,
            _limit: usize,
        ) -> Result<Page, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let newest = end_ms.div_euclid(STEP) * STEP;
            Ok(Page {
                bars: vec![Bar::new(newest / 1000, 1.0, 1.0, 1.0, 1.0)],
                attempts: 1,
                dropped: 0,
            })
        }
    }

    #[test]
    fn page_ceiling_bounds_the_walk() {
        let up = Trickle {
            calls: AtomicUsize::new(0),
        };
        // want 100 at cap 10 allows ceil(100 / 10) + 2 = 12 pages
        let walk = walk_backward(&up, "X", Interval::Minute, 0, 999 * STEP, 100, 10).unwrap();
        assert_eq!(walk.stop, StopReason::PageCeiling);
        assert_eq!(walk.pages, 12);
        assert_eq!(up.calls.load(Ordering::SeqCst), 12);
        assert_eq!(walk.bars.len(), 12);
        assert_eq!(walk.bars.last().unwrap().start_ms(), 999 * STEP);
    }

    #[test]
    fn zero_want_makes_no_calls() {
        let up = History::new(0, 10);
        let walk = walk_backward(&up, "X", Interval::Minute, 0, 9 * STEP, 0, 10).unwrap();
        assert!(walk.bars.is_empty());
        assert_eq!(up.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn paged_fetcher_is_a_bar_source() {
        let fetcher = PagedFetcher::new(History::new(0, 30), 7);
        let bars = fetcher.fetch("X", Interval::Minute, 5 * STEP, 24 * STEP, 100).unwrap();
        assert_eq!(bars.len(), 20);
        assert_eq!(bars[0].start_ms(), 5 * STEP);
        assert_eq!(fetcher.pages().calls.load(Ordering::SeqCst), 3);
    }
}
