//! Redis-backed store shared with the API readers.
//!
//! Hash writes are a single `HSET key f1 v1 f2 v2 ...`, which Redis applies
//! atomically. Locks use `SET NX PX`, released by a compare-and-delete script.

use super::kv::KvStore;
use super::PersistError;
use crate::config::RedisConfig;
use redis::{Commands, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

fn backend(e: redis::RedisError) -> PersistError {
    PersistError::Backend(e.to_string())
}

/// One lazily opened connection, dropped on error and reopened by the next call.
pub struct RedisKv {
    client: redis::Client,
    addr: String,
    timeout: Duration,
    conn: Mutex<Option<redis::Connection>>,
}

impl RedisKv {
    /// Does not connect; the first command does.
    pub fn open(cfg: &RedisConfig) -> Result<Self, PersistError> {
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(cfg.host.clone(), cfg.port),
            redis: RedisConnectionInfo {
                db: cfg.db,
                password: cfg.password.clone(),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info).map_err(backend)?;
        Ok(Self {
            client,
            addr: format!("{}:{}/{}", cfg.host, cfg.port, cfg.db),
            timeout: Duration::from_secs(cfg.connect_timeout_secs.max(1)),
            conn: Mutex::new(None),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, PersistError> {
        let mut slot = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => {
                debug!(addr = %self.addr, "connecting to redis");
                self.client
                    .get_connection_with_timeout(self.timeout)
                    .map_err(backend)?
            }
        };
        match f(&mut conn) {
            Ok(value) => {
                *slot = Some(conn);
                Ok(value)
            }
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "redis command failed, connection dropped");
                Err(backend(e))
            }
        }
    }
}

impl KvStore for RedisKv {
    fn hset_multi(&self, key: &str, fields: &[(String, String)]) -> Result<(), PersistError> {
        if fields.is_empty() {
            return Ok(());
        }
        self.with_conn(|c| c.hset_multiple::<_, _, _, ()>(key, fields))
    }

    fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>, PersistError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|c| redis::cmd("HMGET").arg(key).arg(fields).query(c))
    }

    fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, PersistError> {
        self.with_conn(|c| c.hgetall(key))
    }

    fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, PersistError> {
        // PX must be positive
        let px = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = self.with_conn(|c| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(px)
                .query(c)
        })?;
        Ok(reply.is_some())
    }

    fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, PersistError> {
        let deleted: i64 = self.with_conn(|c| {
            redis::Script::new(RELEASE_SCRIPT)
                .key(key)
                .arg(value)
                .invoke(c)
        })?;
        Ok(deleted > 0)
    }
}

impl std::fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}
