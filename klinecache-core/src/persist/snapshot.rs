//! Per-interval snapshot hashes.
//!
//! Layout of hash `kline:<code>:json`:
//! - `<SYMBOL>`: serialized bar array
//! - `last_ts:<SYMBOL>`: newest bar start in seconds, `0` when empty
//! - `__schema_version`: `"1"`
//! - `__updated_at`: UTC flush time, `%Y-%m-%dT%H:%M:%SZ`

use super::codec::BarCodec;
use super::kv::KvStore;
use super::PersistError;
use crate::domain::{Bar, Interval};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub const SCHEMA_VERSION: &str = "1";
pub const SCHEMA_FIELD: &str = "__schema_version";
pub const UPDATED_FIELD: &str = "__updated_at";
const LAST_TS_PREFIX: &str = "last_ts:";

/// Store key of the snapshot hash for `interval`.
pub fn hash_key(interval: Interval) -> String {
    format!("kline:{}:json", interval.code())
}

fn last_ts_field(symbol: &str) -> String {
    format!("{LAST_TS_PREFIX}{symbol}")
}

fn format_updated_at(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// One symbol's persisted window as read back by a consumer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredWindow {
    pub bars: Vec<Bar>,
    /// Persisted cursor; `None` when absent or zero.
    pub last_ts: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolMeta {
    pub last_ts: Option<i64>,
    /// Bar count, or `None` when the payload does not decode.
    pub bars: Option<usize>,
    pub payload_bytes: usize,
}

/// Bookkeeping view of one snapshot hash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotMeta {
    pub schema_version: Option<String>,
    pub updated_at: Option<String>,
    pub symbols: BTreeMap<String, SymbolMeta>,
}

impl SnapshotMeta {
    pub fn is_empty(&self) -> bool {
        self.schema_version.is_none() && self.symbols.is_empty()
    }
}

#[derive(Clone)]
pub struct SnapshotStore {
    kv: Arc<dyn KvStore>,
    codec: BarCodec,
}

impl SnapshotStore {
    pub fn new(kv: Arc<dyn KvStore>, codec: BarCodec) -> Self {
        Self { kv, codec }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Write every given window plus bookkeeping fields in one batch.
    ///
    /// Returns the number of symbols written.
    pub fn flush<'a, I>(
        &self,
        interval: Interval,
        windows: I,
        updated_at: DateTime<Utc>,
    ) -> Result<usize, PersistError>
    where
        I: IntoIterator<Item = (&'a str, &'a [Bar])>,
    {
        let mut fields = vec![
            (SCHEMA_FIELD.to_string(), SCHEMA_VERSION.to_string()),
            (UPDATED_FIELD.to_string(), format_updated_at(updated_at)),
        ];
        let mut written = 0;
        for (symbol, bars) in windows {
            let last = bars.last().map_or(0, |b| b.timestamp);
            fields.push((symbol.to_string(), self.codec.serialize(bars)?));
            fields.push((last_ts_field(symbol), last.to_string()));
            written += 1;
        }

        let key = hash_key(interval);
        self.kv.hset_multi(&key, &fields)?;
        debug!(key = %key, symbols = written, "snapshot flushed");
        Ok(written)
    }

    /// Read one symbol's window and cursor in a single batched call.
    pub fn load_window(&self, symbol: &str, interval: Interval) -> Result<StoredWindow, PersistError> {
        let key = hash_key(interval);
        let got = self
            .kv
            .hmget(&key, &[symbol.to_string(), last_ts_field(symbol)])?;
        let mut got = got.into_iter();
        let payload = got.next().flatten();
        let cursor = got.next().flatten();
        self.decode(&key, symbol, payload.as_deref(), cursor.as_deref())
    }

    /// Read several symbols in a single batched call.
    ///
    /// A payload that fails to decode is reported per symbol; the others
    /// are unaffected.
    pub fn load_windows(
        &self,
        symbols: &[String],
        interval: Interval,
    ) -> Result<BTreeMap<String, Result<StoredWindow, PersistError>>, PersistError> {
        let key = hash_key(interval);
        let fields: Vec<String> = symbols
            .iter()
            .flat_map(|s| [s.clone(), last_ts_field(s)])
            .collect();
        let got = self.kv.hmget(&key, &fields)?;

        Ok(symbols
            .iter()
            .zip(got.chunks(2))
            .map(|(symbol, pair)| {
                let payload = pair.first().cloned().flatten();
                let cursor = pair.get(1).cloned().flatten();
                let window = self.decode(&key, symbol, payload.as_deref(), cursor.as_deref());
                (symbol.clone(), window)
            })
            .collect())
    }

    /// Schema version, flush time and per-symbol cursors for `interval`.
    pub fn snapshot_meta(&self, interval: Interval) -> Result<SnapshotMeta, PersistError> {
        let all = self.kv.hgetall(&hash_key(interval))?;
        let mut meta = SnapshotMeta {
            schema_version: all.get(SCHEMA_FIELD).cloned(),
            updated_at: all.get(UPDATED_FIELD).cloned(),
            symbols: BTreeMap::new(),
        };
        for (field, value) in &all {
            if field.starts_with("__") {
                continue;
            }
            if let Some(symbol) = field.strip_prefix(LAST_TS_PREFIX) {
                let entry = meta.symbols.entry(symbol.to_string()).or_default();
                entry.last_ts = value.parse::<i64>().ok().filter(|ts| *ts > 0);
            } else {
                let entry = meta.symbols.entry(field.clone()).or_default();
                entry.payload_bytes = value.len();
                entry.bars = self.codec.deserialize(Some(value.as_str())).ok().map(|b| b.len());
            }
        }
        Ok(meta)
    }

    fn decode(
        &self,
        key: &str,
        symbol: &str,
        payload: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<StoredWindow, PersistError> {
        let bars = self.codec.deserialize(payload).map_err(|e| PersistError::Corrupt {
            key: format!("{key}/{symbol}"),
            reason: e.to_string(),
        })?;
        let last_ts = match cursor.map(str::trim).filter(|c| !c.is_empty()) {
            None => None,
            Some(c) => {
                let ts: i64 = c.parse().map_err(|_| PersistError::Corrupt {
                    key: format!("{key}/{}", last_ts_field(symbol)),
                    reason: format!("not an integer: '{c}'"),
                })?;
                (ts > 0).then_some(ts)
            }
        };
        Ok(StoredWindow { bars, last_ts })
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}
