//! Bar source traits and structured fetch errors.
//!
//! Two layers: a [`PageSource`] performs one upstream call (with its own
//! retry policy), a [`BarSource`] answers a whole range request, paginating
//! over a page source when the range exceeds the per-call cap. The window
//! store only ever sees a `BarSource`, so tests can swap in an in-memory one.

use crate::domain::{Bar, Interval};
use thiserror::Error;

/// Structured fetch errors.
///
/// Malformed rows are not errors: they are dropped and counted in [`Page`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// The upstream refused the request (authorization, bad parameters).
    /// Retrying will not help; the symbol is skipped for this run.
    #[error("upstream rejected request for {symbol} (status {status}): {message}")]
    Permanent {
        symbol: String,
        status: u16,
        message: String,
    },

    /// Rate limiting, server errors or network failures outlasted the
    /// retry budget. The next scheduled run retries.
    #[error("upstream unavailable for {symbol} after {attempts} attempts: {last_error}")]
    Retryable {
        symbol: String,
        attempts: u32,
        last_error: String,
    },

    #[error("invalid fetch request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Retryable { .. })
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, FetchError::Permanent { .. })
    }
}

/// Result of one upstream call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Bars in ascending timestamp order.
    pub bars: Vec<Bar>,
    /// HTTP calls made, including retries.
    pub attempts: u32,
    /// Rows dropped as malformed.
    pub dropped: usize,
}

/// One upstream request for at most `limit` bars in `[start_ms, end_ms]`.
///
/// Providers return the newest `limit` bars of the range when more exist.
pub trait PageSource: Send + Sync {
    fn name(&self) -> &str;

    fn fetch_page(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Page, FetchError>;
}

/// Ordered bars for a range, regardless of how many upstream calls it takes.
pub trait BarSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Fetch up to `limit` bars in `[start_ms, end_ms]`: ascending, free of
    /// duplicate timestamps, and keeping the most recent bars when the range
    /// holds more than `limit`.
    fn fetch(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> Result<Vec<Bar>, FetchError>;
}
