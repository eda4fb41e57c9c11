//! Best-effort job lock: set-if-absent with a TTL, released on drop.
//!
//! Expiry protects against a crashed holder. Release only deletes the key if
//! it still holds this guard's token, so a lock that expired and was taken
//! over by another worker is left alone.

use klinecache_core::persist::{KvStore, PersistError};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Store key of the lock for `job`.
pub fn lock_key(job: &str) -> String {
    format!("lock:kline:{job}")
}

#[derive(Clone)]
pub struct JobLock {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl JobLock {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Take the lock for `job`, or `None` if another holder has it.
    pub fn try_acquire(&self, job: &str) -> Result<Option<LockGuard>, PersistError> {
        let key = lock_key(job);
        let token = new_token();
        if !self.kv.set_nx_px(&key, &token, self.ttl)? {
            debug!(key, "lock held elsewhere");
            return Ok(None);
        }
        debug!(key, ttl_secs = self.ttl.as_secs(), "lock acquired");
        Ok(Some(LockGuard {
            kv: Arc::clone(&self.kv),
            key,
            token,
        }))
    }
}

impl std::fmt::Debug for JobLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLock").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

/// Unique holder token: process id, wall clock and randomness, hashed.
fn new_token() -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&std::process::id().to_le_bytes());
    hasher.update(&chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(&rand::thread_rng().gen::<u64>().to_le_bytes());
    hasher.finalize().to_hex().as_str()[..16].to_string()
}

/// Held lock. Dropping it releases the key.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    kv: Arc<dyn KvStore>,
    key: String,
    token: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match self.kv.del_if_eq(&self.key, &self.token) {
            Ok(true) => debug!(key = %self.key, "lock released"),
            Ok(false) => warn!(key = %self.key, "lock expired before release"),
            Err(e) => warn!(key = %self.key, error = %e, "lock release failed; it will expire"),
        }
    }
}
