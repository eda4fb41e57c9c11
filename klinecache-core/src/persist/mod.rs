//! Snapshot persistence: bar codec, key-value store seam, per-interval hashes.

pub mod codec;
pub mod kv;
pub mod redis_kv;
pub mod snapshot;

pub use codec::BarCodec;
pub use kv::{FileKv, KvStore, MemoryKv};
pub use redis_kv::RedisKv;
pub use snapshot::{hash_key, SnapshotMeta, SnapshotStore, StoredWindow, SymbolMeta};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode snapshot: {0}")]
    Encode(String),

    #[error("decode snapshot: {0}")]
    Decode(String),

    #[error("store backend: {0}")]
    Backend(String),

    #[error("corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}
