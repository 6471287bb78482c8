//! Narrow capability interface over the external KV store (spec §6, §9.4).
//!
//! `RedisKv` backs this with a real Redis connection; `MemoryKv` backs it
//! with an in-process store so C1/C2/C5 can be unit tested without a live
//! Redis, per design note 9.4.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::error::{OrchestratorError, Result};

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set_ex(&self, key: &str, ttl_seconds: u64, value: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn del(&self, key: &str) -> Result<()>;

    async fn h_set(&self, hash: &str, field: &str, value: &str) -> Result<()>;
    async fn h_del(&self, hash: &str, field: &str) -> Result<()>;
    async fn h_get_all(&self, hash: &str) -> Result<HashMap<String, String>>;

    async fn s_add(&self, key: &str, member: &str) -> Result<()>;
    async fn s_rem(&self, key: &str, member: &str) -> Result<()>;
    async fn s_members(&self, key: &str) -> Result<Vec<String>>;
    async fn s_is_member(&self, key: &str, member: &str) -> Result<bool>;
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()>;

    async fn z_add(&self, key: &str, score: f64, member: &str) -> Result<()>;
    async fn z_rem(&self, key: &str, member: &str) -> Result<()>;
    async fn z_remrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<()>;
    async fn z_card(&self, key: &str) -> Result<usize>;
    async fn z_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// Set-if-absent with a TTL in one round trip. Returns `true` if the key
    /// was created (the caller "won"), `false` if it already existed.
    async fn set_nx_ex(&self, key: &str, ttl_seconds: u64, value: &str) -> Result<bool>;
}

/// Redis-backed implementation. Holds a single `ConnectionManager`, which
/// transparently reconnects; no pooling beyond what `ConnectionManager`
/// already provides (pooling proper is an excluded external collaborator
/// per spec §1).
#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(OrchestratorError::from)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(OrchestratorError::from)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn set_ex(&self, key: &str, ttl_seconds: u64, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_seconds).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn h_set(&self, hash: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(hash, field, value).await?;
        Ok(())
    }

    async fn h_del(&self, hash: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(hash, field).await?;
        Ok(())
    }

    async fn h_get_all(&self, hash: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(hash).await?)
    }

    async fn s_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn s_rem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn s_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn s_is_member(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(key, member).await?)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl_seconds as i64).await?;
        Ok(())
    }

    async fn z_add(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn z_rem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zrem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn z_remrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zrembyscore::<_, _, _, ()>(key, min, max).await?;
        Ok(())
    }

    async fn z_card(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(key).await?)
    }

    async fn z_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrange(key, start, stop).await?)
    }

    async fn set_nx_ex(&self, key: &str, ttl_seconds: u64, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let opts = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(ttl_seconds as usize));
        let result: Option<String> = conn.set_options(key, value, opts).await?;
        Ok(result.is_some())
    }
}

/// In-process substitute for tests (design note 9.4). Sorted sets and
/// expiring keys are modeled directly rather than via a generic value enum,
/// since those are the only structures the orchestrator actually needs.
#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, (String, Option<SystemTime>)>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, std::collections::HashSet<String>>,
    sorted: HashMap<String, HashMap<String, f64>>,
    expirations: HashMap<String, SystemTime>,
}

#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn now() -> SystemTime {
        SystemTime::now()
    }
}

fn not_expired(expiry: Option<SystemTime>) -> bool {
    match expiry {
        Some(t) => t > SystemTime::now(),
        None => true,
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_ex(&self, key: &str, ttl_seconds: u64, value: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        let expiry = Self::now() + Duration::from_secs(ttl_seconds);
        state
            .strings
            .insert(key.to_string(), (value.to_string(), Some(expiry)));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.inner.lock().await;
        if let Some((value, expiry)) = state.strings.get(key).cloned() {
            if not_expired(expiry) {
                return Ok(Some(value));
            }
            state.strings.remove(key);
        }
        Ok(None)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        state.strings.remove(key);
        state.hashes.remove(key);
        state.sets.remove(key);
        state.sorted.remove(key);
        state.expirations.remove(key);
        Ok(())
    }

    async fn h_set(&self, hash: &str, field: &str, value: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        state
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn h_del(&self, hash: &str, field: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        if let Some(h) = state.hashes.get_mut(hash) {
            h.remove(field);
        }
        Ok(())
    }

    async fn h_get_all(&self, hash: &str) -> Result<HashMap<String, String>> {
        let state = self.inner.lock().await;
        Ok(state.hashes.get(hash).cloned().unwrap_or_default())
    }

    async fn s_add(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn s_rem(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        if let Some(s) = state.sets.get_mut(key) {
            s.remove(member);
        }
        Ok(())
    }

    async fn s_members(&self, key: &str) -> Result<Vec<String>> {
        let state = self.inner.lock().await;
        Ok(state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn s_is_member(&self, key: &str, member: &str) -> Result<bool> {
        let state = self.inner.lock().await;
        Ok(state
            .sets
            .get(key)
            .map(|s| s.contains(member))
            .unwrap_or(false))
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()> {
        let mut state = self.inner.lock().await;
        state
            .expirations
            .insert(key.to_string(), Self::now() + Duration::from_secs(ttl_seconds));
        Ok(())
    }

    async fn z_add(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        state
            .sorted
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn z_rem(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        if let Some(z) = state.sorted.get_mut(key) {
            z.remove(member);
        }
        Ok(())
    }

    async fn z_remrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<()> {
        let mut state = self.inner.lock().await;
        if let Some(z) = state.sorted.get_mut(key) {
            z.retain(|_, score| *score < min || *score > max);
        }
        Ok(())
    }

    async fn z_card(&self, key: &str) -> Result<usize> {
        let state = self.inner.lock().await;
        Ok(state.sorted.get(key).map(|z| z.len()).unwrap_or(0))
    }

    async fn z_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let state = self.inner.lock().await;
        let Some(z) = state.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(&String, &f64)> = z.iter().collect();
        entries.sort_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal));
        let len = entries.len() as isize;
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let (s, e) = (norm(start), norm(stop).min(len - 1));
        if len == 0 || s > e {
            return Ok(Vec::new());
        }
        Ok(entries[s as usize..=(e as usize)]
            .iter()
            .map(|(member, _)| (*member).clone())
            .collect())
    }

    async fn set_nx_ex(&self, key: &str, ttl_seconds: u64, value: &str) -> Result<bool> {
        let mut state = self.inner.lock().await;
        if let Some((_, expiry)) = state.strings.get(key) {
            if not_expired(*expiry) {
                return Ok(false);
            }
        }
        let expiry = Self::now() + Duration::from_secs(ttl_seconds);
        state
            .strings
            .insert(key.to_string(), (value.to_string(), Some(expiry)));
        Ok(true)
    }
}

pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
