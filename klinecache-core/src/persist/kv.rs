//! Key-value store seam.
//!
//! The snapshot layer needs a small subset of a Redis-like API: hashes with
//! batched multi-field writes and reads, plus set-if-absent keys with an
//! expiry for job locks. A hash write is one atomic replacement, so readers
//! observe either the prior document or the new one.

use super::PersistError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

pub trait KvStore: Send + Sync {
    /// Set several fields of a hash in one atomic write. Other fields are kept.
    fn hset_multi(&self, key: &str, fields: &[(String, String)]) -> Result<(), PersistError>;

    /// Read several fields of a hash. Missing fields come back as `None`.
    fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, PersistError>;

    /// Read every field of a hash. A missing hash is empty.
    fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, PersistError>;

    /// Create `key` holding `value` unless a live entry already exists.
    fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, PersistError>;

    /// Delete `key` only if it currently holds `value`.
    fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, PersistError>;
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

/// Process-local store. Snapshots live as long as the value.
#[derive(Debug, Default)]
pub struct MemoryKv {
    hashes: Mutex<HashMap<String, BTreeMap<String, String>>>,
    keys: Mutex<HashMap<String, (String, i64)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn hset_multi(&self, key: &str, fields: &[(String, String)]) -> Result<(), PersistError> {
        let mut hashes = self.hashes.lock().unwrap_or_else(PoisonError::into_inner);
        let doc = hashes.entry(key.to_string()).or_default();
        for (f, v) in fields {
            doc.insert(f.clone(), v.clone());
        }
        Ok(())
    }

    fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, PersistError> {
        let hashes = self.hashes.lock().unwrap_or_else(PoisonError::into_inner);
        let doc = hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| doc.and_then(|d| d.get(f).cloned()))
            .collect())
    }

    fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, PersistError> {
        let hashes = self.hashes.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(hashes.get(key).cloned().unwrap_or_default())
    }

    fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, PersistError> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, expires)) = keys.get(key) {
            if *expires > now_ms() {
                return Ok(false);
            }
        }
        keys.insert(key.to_string(), (value.to_string(), expiry_ms(ttl)));
        Ok(true)
    }

    fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, PersistError> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        match keys.get(key) {
            Some((held, _)) if held == value => {
                keys.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockFile {
    value: String,
    expires_at_ms: i64,
}

/// Directory-backed store.
///
/// Layout: `{dir}/hash/{key}.json` holds one JSON object per hash and
/// `{dir}/lock/{key}.lock` holds one lock entry. Every file is replaced via
/// write-to-temp then rename. Lock entries are only read and replaced while
/// holding an exclusive advisory lock on `{dir}/lock/{key}.guard`, so two
/// handles (or processes) never both take over the same expired entry.
#[derive(Debug)]
pub struct FileKv {
    dir: PathBuf,
    write_guard: Mutex<()>,
}

impl FileKv {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(dir.join("hash"))?;
        fs::create_dir_all(dir.join("lock"))?;
        Ok(Self {
            dir,
            write_guard: Mutex::new(()),
        })
    }

    fn hash_path(&self, key: &str) -> PathBuf {
        self.dir.join("hash").join(format!("{}.json", file_stem(key)))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join("lock").join(format!("{}.lock", file_stem(key)))
    }

    fn read_doc(&self, key: &str) -> Result<BTreeMap<String, String>, PersistError> {
        let path = self.hash_path(key);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&text).map_err(|e| PersistError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn read_lock(&self, path: &Path) -> Option<LockFile> {
        let text = fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Run `f` on the lock entry path while holding its guard file.
    fn guarded<T>(
        &self,
        key: &str,
        f: impl FnOnce(&Path) -> Result<T, PersistError>,
    ) -> Result<T, PersistError> {
        let path = self.lock_path(key);
        let guard_file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path.with_extension("guard"))?;
        let mut guard = fd_lock::RwLock::new(guard_file);
        let _held = guard.write()?;
        f(&path)
    }
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<(), PersistError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    fs::write(&tmp_path, body)?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        PersistError::Io(e)
    })
}

/// Filesystem-safe name: readable prefix plus a short content hash so that
/// keys differing only in punctuation do not collide.
fn file_stem(key: &str) -> String {
    let readable: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let digest = blake3::hash(key.as_bytes()).to_hex();
    format!("{readable}-{}", &digest.as_str()[..12])
}

impl KvStore for FileKv {
    fn hset_multi(&self, key: &str, fields: &[(String, String)]) -> Result<(), PersistError> {
        let _guard = self.write_guard.lock().unwrap_or_else(PoisonError::into_inner);

        let mut doc = match self.read_doc(key) {
            Ok(doc) => doc,
            Err(PersistError::Corrupt { reason, .. }) => {
                warn!(key, %reason, "replacing unreadable hash document");
                BTreeMap::new()
            }
            Err(e) => return Err(e),
        };
        for (f, v) in fields {
            doc.insert(f.clone(), v.clone());
        }

        let body = serde_json::to_vec(&doc).map_err(|e| PersistError::Encode(e.to_string()))?;
        write_atomic(&self.hash_path(key), &body)?;
        debug!(key, fields = fields.len(), "hash written");
        Ok(())
    }

    fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, PersistError> {
        let doc = self.read_doc(key)?;
        Ok(fields.iter().map(|f| doc.get(f).cloned()).collect())
    }

    fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, PersistError> {
        self.read_doc(key)
    }

    fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, PersistError> {
        self.guarded(key, |path| {
            if let Some(held) = self.read_lock(path) {
                if held.expires_at_ms > now_ms() {
                    return Ok(false);
                }
                warn!(key, "taking over expired lock");
            }
            let entry = LockFile {
                value: value.to_string(),
                expires_at_ms: expiry_ms(ttl),
            };
            let body =
                serde_json::to_vec(&entry).map_err(|e| PersistError::Encode(e.to_string()))?;
            write_atomic(path, &body)?;
            Ok(true)
        })
    }

    fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, PersistError> {
        self.guarded(key, |path| match self.read_lock(path) {
            Some(held) if held.value == value => match fs::remove_file(path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            },
            _ => Ok(false),
        })
    }
}
