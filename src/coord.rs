//! Coordination store facade.
//!
//! The crawler's shared mutable state (frontier, filter bits, in-flight
//! claims, domain leases) lives behind this narrow capability trait so the
//! backing store is swappable. `RedisStore` is the production backend;
//! `MemoryStore` backs tests and single-process runs.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use thiserror::Error;

/// Deadline applied to every individual store round-trip.
const OP_TIMEOUT: Duration = Duration::from_secs(5);

/// SCAN page size for prefix scans.
const SCAN_COUNT: usize = 512;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("coordination store timed out during {0}")]
    Timeout(&'static str),

    #[error("coordination store unreachable: {0}")]
    Connection(String),

    #[error("coordination store protocol error: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for CoordError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_connection_refusal() || error.is_connection_dropped() || error.is_io_error() {
            CoordError::Connection(error.to_string())
        } else {
            CoordError::Protocol(error.to_string())
        }
    }
}

/// Atomic primitives the rest of the core depends on.
///
/// Multi-index bitfield reads/writes and `kv_get_many` are the batched
/// (pipelined) operations; atomicity across a batch is not implied, only
/// round-trip amortization.
#[async_trait]
pub trait CoordStore: Send + Sync {
    async fn ping(&self) -> Result<(), CoordError>;

    async fn bitfield_get_bits(&self, key: &str, indices: &[u64]) -> Result<Vec<bool>, CoordError>;
    async fn bitfield_set_bits(&self, key: &str, indices: &[u64]) -> Result<(), CoordError>;
    async fn bitfield_count_ones(&self, key: &str) -> Result<u64, CoordError>;

    async fn zset_add(&self, key: &str, score: f64, member: &str) -> Result<(), CoordError>;
    async fn zset_pop_min(&self, key: &str) -> Result<Option<(f64, String)>, CoordError>;
    async fn zset_card(&self, key: &str) -> Result<u64, CoordError>;

    async fn kv_set(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<(), CoordError>;
    async fn kv_set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoordError>;
    async fn kv_compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CoordError>;
    async fn kv_get(&self, key: &str) -> Result<Option<String>, CoordError>;
    async fn kv_delete(&self, key: &str) -> Result<(), CoordError>;
    async fn kv_scan(&self, prefix: &str) -> Result<Vec<String>, CoordError>;
    async fn kv_get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CoordError>;
}

/// Delete a key only while it still holds the expected value. Running this
/// server-side keeps release from clobbering a successor's lease.
const COMPARE_AND_DELETE: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    else
        return 0
    end
";

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    cad_script: redis::Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, CoordError> {
        let client = Client::open(redis_url)?;
        let conn = tokio::time::timeout(OP_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| CoordError::Timeout("connect"))??;

        Ok(Self {
            conn,
            cad_script: redis::Script::new(COMPARE_AND_DELETE),
        })
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl CoordStore for RedisStore {
    async fn ping(&self) -> Result<(), CoordError> {
        let mut conn = self.conn.clone();
        let reply: String = tokio::time::timeout(
            OP_TIMEOUT,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .map_err(|_| CoordError::Timeout("ping"))??;

        if reply == "PONG" {
            Ok(())
        } else {
            Err(CoordError::Protocol(format!("unexpected PING reply: {}", reply)))
        }
    }

    async fn bitfield_get_bits(&self, key: &str, indices: &[u64]) -> Result<Vec<bool>, CoordError> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for idx in indices {
            pipe.cmd("GETBIT").arg(key).arg(*idx);
        }

        let bits: Vec<i64> = tokio::time::timeout(OP_TIMEOUT, pipe.query_async(&mut conn))
            .await
            .map_err(|_| CoordError::Timeout("bitfield_get_bits"))??;

        Ok(bits.into_iter().map(|b| b != 0).collect())
    }

    async fn bitfield_set_bits(&self, key: &str, indices: &[u64]) -> Result<(), CoordError> {
        if indices.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for idx in indices {
            pipe.cmd("SETBIT").arg(key).arg(*idx).arg(1).ignore();
        }

        let _: () = tokio::time::timeout(OP_TIMEOUT, pipe.query_async(&mut conn))
            .await
            .map_err(|_| CoordError::Timeout("bitfield_set_bits"))??;
        Ok(())
    }

    async fn bitfield_count_ones(&self, key: &str) -> Result<u64, CoordError> {
        let mut conn = self.conn.clone();
        let ones: u64 = tokio::time::timeout(
            OP_TIMEOUT,
            redis::cmd("BITCOUNT").arg(key).query_async(&mut conn),
        )
        .await
        .map_err(|_| CoordError::Timeout("bitfield_count_ones"))??;
        Ok(ones)
    }

    async fn zset_add(&self, key: &str, score: f64, member: &str) -> Result<(), CoordError> {
        let mut conn = self.conn.clone();
        let _: () = tokio::time::timeout(
            OP_TIMEOUT,
            redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| CoordError::Timeout("zset_add"))??;
        Ok(())
    }

    async fn zset_pop_min(&self, key: &str) -> Result<Option<(f64, String)>, CoordError> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = tokio::time::timeout(
            OP_TIMEOUT,
            redis::cmd("ZPOPMIN").arg(key).arg(1).query_async(&mut conn),
        )
        .await
        .map_err(|_| CoordError::Timeout("zset_pop_min"))??;

        Ok(popped
            .into_iter()
            .next()
            .map(|(member, score)| (score, member)))
    }

    async fn zset_card(&self, key: &str) -> Result<u64, CoordError> {
        let mut conn = self.conn.clone();
        let card: u64 = tokio::time::timeout(
            OP_TIMEOUT,
            redis::cmd("ZCARD").arg(key).query_async(&mut conn),
        )
        .await
        .map_err(|_| CoordError::Timeout("zset_card"))??;
        Ok(card)
    }

    async fn kv_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(Self::ttl_secs(ttl));
        }

        let _: () = tokio::time::timeout(OP_TIMEOUT, cmd.query_async(&mut conn))
            .await
            .map_err(|_| CoordError::Timeout("kv_set"))??;
        Ok(())
    }

    async fn kv_set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoordError> {
        let mut conn = self.conn.clone();
        let acquired: bool = tokio::time::timeout(
            OP_TIMEOUT,
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(Self::ttl_secs(ttl))
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| CoordError::Timeout("kv_set_if_absent"))??;
        Ok(acquired)
    }

    async fn kv_compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CoordError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = tokio::time::timeout(
            OP_TIMEOUT,
            self.cad_script
                .key(key)
                .arg(expected)
                .invoke_async(&mut conn),
        )
        .await
        .map_err(|_| CoordError::Timeout("kv_compare_and_delete"))??;
        Ok(deleted == 1)
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, CoordError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = tokio::time::timeout(
            OP_TIMEOUT,
            redis::cmd("GET").arg(key).query_async(&mut conn),
        )
        .await
        .map_err(|_| CoordError::Timeout("kv_get"))??;
        Ok(value)
    }

    async fn kv_delete(&self, key: &str) -> Result<(), CoordError> {
        let mut conn = self.conn.clone();
        let _: () = tokio::time::timeout(
            OP_TIMEOUT,
            redis::cmd("DEL").arg(key).query_async(&mut conn),
        )
        .await
        .map_err(|_| CoordError::Timeout("kv_delete"))??;
        Ok(())
    }

    async fn kv_scan(&self, prefix: &str) -> Result<Vec<String>, CoordError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, page): (u64, Vec<String>) = tokio::time::timeout(
                OP_TIMEOUT,
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn),
            )
            .await
            .map_err(|_| CoordError::Timeout("kv_scan"))??;

            keys.extend(page);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }

    async fn kv_get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CoordError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = tokio::time::timeout(
            OP_TIMEOUT,
            redis::cmd("MGET").arg(keys).query_async(&mut conn),
        )
        .await
        .map_err(|_| CoordError::Timeout("kv_get_many"))??;
        Ok(values)
    }
}

#[derive(Default)]
struct MemoryInner {
    bits: HashMap<String, Vec<u8>>,
    zsets: HashMap<String, Vec<(f64, String)>>,
    kv: HashMap<String, (String, Option<Instant>)>,
}

impl MemoryInner {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.kv
            .retain(|_, (_, expiry)| expiry.map(|at| at > now).unwrap_or(true));
    }
}

/// Single-process backend with the same atomicity semantics as Redis.
#[derive(Default)]
pub struct MemoryStore {
    inner: parking_lot::Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordStore for MemoryStore {
    async fn ping(&self) -> Result<(), CoordError> {
        Ok(())
    }

    async fn bitfield_get_bits(&self, key: &str, indices: &[u64]) -> Result<Vec<bool>, CoordError> {
        let inner = self.inner.lock();
        let bytes = inner.bits.get(key);
        Ok(indices
            .iter()
            .map(|idx| {
                let (byte, bit) = ((idx / 8) as usize, 7 - (idx % 8) as u8);
                bytes
                    .and_then(|b| b.get(byte))
                    .map(|b| b & (1 << bit) != 0)
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn bitfield_set_bits(&self, key: &str, indices: &[u64]) -> Result<(), CoordError> {
        let mut inner = self.inner.lock();
        let bytes = inner.bits.entry(key.to_string()).or_default();
        for idx in indices {
            let (byte, bit) = ((idx / 8) as usize, 7 - (idx % 8) as u8);
            if bytes.len() <= byte {
                bytes.resize(byte + 1, 0);
            }
            bytes[byte] |= 1 << bit;
        }
        Ok(())
    }

    async fn bitfield_count_ones(&self, key: &str) -> Result<u64, CoordError> {
        let inner = self.inner.lock();
        Ok(inner
            .bits
            .get(key)
            .map(|bytes| bytes.iter().map(|b| b.count_ones() as u64).sum())
            .unwrap_or(0))
    }

    async fn zset_add(&self, key: &str, score: f64, member: &str) -> Result<(), CoordError> {
        let mut inner = self.inner.lock();
        let zset = inner.zsets.entry(key.to_string()).or_default();
        match zset.iter_mut().find(|(_, m)| m == member) {
            Some(entry) => entry.0 = score,
            None => zset.push((score, member.to_string())),
        }
        Ok(())
    }

    async fn zset_pop_min(&self, key: &str) -> Result<Option<(f64, String)>, CoordError> {
        let mut inner = self.inner.lock();
        let zset = match inner.zsets.get_mut(key) {
            Some(z) if !z.is_empty() => z,
            _ => return Ok(None),
        };

        // Strict less-than keeps insertion order as the tie-break.
        let mut min_idx = 0;
        for (idx, (score, _)) in zset.iter().enumerate() {
            if *score < zset[min_idx].0 {
                min_idx = idx;
            }
        }
        let (score, member) = zset.remove(min_idx);
        Ok(Some((score, member)))
    }

    async fn zset_card(&self, key: &str) -> Result<u64, CoordError> {
        let inner = self.inner.lock();
        Ok(inner.zsets.get(key).map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn kv_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), CoordError> {
        let mut inner = self.inner.lock();
        let expiry = ttl.map(|d| Instant::now() + d);
        inner.kv.insert(key.to_string(), (value.to_string(), expiry));
        Ok(())
    }

    async fn kv_set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CoordError> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        if inner.kv.contains_key(key) {
            return Ok(false);
        }
        let expiry = Some(Instant::now() + ttl);
        inner.kv.insert(key.to_string(), (value.to_string(), expiry));
        Ok(true)
    }

    async fn kv_compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CoordError> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        if inner.kv.get(key).map(|(v, _)| v.as_str()) == Some(expected) {
            inner.kv.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, CoordError> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        Ok(inner.kv.get(key).map(|(v, _)| v.clone()))
    }

    async fn kv_delete(&self, key: &str) -> Result<(), CoordError> {
        let mut inner = self.inner.lock();
        inner.kv.remove(key);
        Ok(())
    }

    async fn kv_scan(&self, prefix: &str) -> Result<Vec<String>, CoordError> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        Ok(inner
            .kv
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn kv_get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CoordError> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        Ok(keys
            .iter()
            .map(|k| inner.kv.get(k).map(|(v, _)| v.clone()))
            .collect())
    }
}
