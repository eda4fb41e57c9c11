//! Klinecache Core: kline windows kept current from an exchange API.
//!
//! This crate contains everything below the scheduler:
//! - Domain types (bars, intervals, window keys)
//! - Bar-boundary math for closed-bar fetch ranges
//! - Upstream fetcher with backward pagination and retry/backoff
//! - Bounded per-(interval, symbol) window store with idempotent merge
//! - Snapshot persistence behind a key-value store trait
//! - Configuration (TOML + environment overrides)

pub mod config;
pub mod data;
pub mod domain;
pub mod persist;
pub mod window;
