//! Domain types: bars, intervals, window keys.

pub mod bar;
pub mod interval;

pub use bar::Bar;
pub use interval::{normalize_symbol, Interval, ParseIntervalError, WindowKey};
