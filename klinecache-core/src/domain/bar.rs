//! Bar: one closed OHLC candle for a single symbol and interval.

use serde::{Deserialize, Serialize};

/// OHLC bar keyed by the start of its interval, in epoch seconds.
///
/// The timestamp is serialized as `time` so persisted snapshots keep the
/// layout consumers already read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    #[serde(rename = "time")]
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
        }
    }

    /// Start of the bar in epoch milliseconds.
    pub fn start_ms(&self) -> i64 {
        self.timestamp * 1000
    }

    /// True when every price field is a finite number.
    pub fn is_finite(&self) -> bool {
        self.open.is_finite() && self.high.is_finite() && self.low.is_finite() && self.close.is_finite()
    }

    /// Basic OHLC sanity check: high bounds the range, low bounds it from below.
    pub fn is_sane(&self) -> bool {
        self.is_finite()
            && self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
    }
}
