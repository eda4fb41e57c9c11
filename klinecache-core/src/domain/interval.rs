//! Bar intervals and window keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bar duration. Only minute and day candles are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Minute,
    Day,
}

impl Interval {
    pub const ALL: [Interval; 2] = [Interval::Minute, Interval::Day];

    /// Length of one bar in milliseconds.
    pub const fn step_ms(self) -> i64 {
        match self {
            Interval::Minute => 60_000,
            Interval::Day => 86_400_000,
        }
    }

    /// Upstream interval code (`"1"` or `"D"`), also used in store keys.
    pub const fn code(self) -> &'static str {
        match self {
            Interval::Minute => "1",
            Interval::Day => "D",
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Interval::Minute => "minute",
            Interval::Day => "day",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown interval '{0}' (expected minute/1 or day/D)")]
pub struct ParseIntervalError(pub String);

impl FromStr for Interval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" | "m" | "1m" | "minute" | "Minute" => Ok(Interval::Minute),
            "D" | "d" | "1d" | "day" | "Day" => Ok(Interval::Day),
            other => Err(ParseIntervalError(other.to_string())),
        }
    }
}

/// Identity of one window: an interval plus an upper-case ticker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    pub interval: Interval,
    pub symbol: String,
}

impl WindowKey {
    pub fn new(interval: Interval, symbol: impl AsRef<str>) -> Self {
        Self {
            interval,
            symbol: normalize_symbol(symbol.as_ref()),
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.interval.code(), self.symbol)
    }
}

/// Exchange tickers are stored upper-case with surrounding whitespace removed.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}
