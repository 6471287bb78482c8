//! Stream Manager (C5) — authoritative lifecycle of a stream, stream-key
//! issuance/validation, and cross-worker fan-out via the KV store (spec §3,
//! §4.1). Grounded on `manager.rs`'s `StreamManager`: worker-local
//! `RwLock<HashMap<...>>` of records guarded by a single struct, serialized
//! mutation, reads fanned out to a shared store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{OrchestratorError, Result};
use crate::kv::KvStore;
use crate::metrics::ACTIVE_STREAMS;

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Pending,
    Live,
    Ended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub stream_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub title: String,
    pub status: StreamStatus,
    pub started_at: Option<u64>,
    pub ended_at: Option<u64>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct StreamManagerStats {
    pub total_known: usize,
    pub live: usize,
    pub pending: usize,
    pub ended: usize,
}

/// Narrow capability consumed by the signaling router (design note 9.6):
/// it only ever needs to validate a stream key, never the full manager.
#[async_trait]
pub trait StreamKeyValidator: Send + Sync {
    async fn validate_stream_key(&self, tenant_id: &str, stream_id: &str, key: &str) -> bool;
}

fn stream_key_kv_key(tenant_id: &str, stream_id: &str) -> String {
    format!("stream_key:{tenant_id}:{stream_id}")
}

const ACTIVE_STREAMS_HASH: &str = "active_streams";

#[derive(Clone)]
pub struct StreamManager {
    streams: Arc<RwLock<HashMap<String, StreamRecord>>>,
    kv: Arc<dyn KvStore>,
    stream_key_ttl: u64,
}

impl StreamManager {
    pub fn new(kv: Arc<dyn KvStore>, stream_key_ttl: u64) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            kv,
            stream_key_ttl,
        }
    }

    /// Generates ids, records the entity as pending, and writes the stream
    /// key to KV with a TTL. Rolls back the local insert if the KV write
    /// fails (spec §4.1: "atomic rollback").
    pub async fn create_stream(
        &self,
        tenant_id: &str,
        user_id: &str,
        title: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(String, String)> {
        let stream_id = format!("stream_{}", random_hex(12));
        let stream_key = format!("sk_{}", random_hex(24));

        let record = StreamRecord {
            stream_id: stream_id.clone(),
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            status: StreamStatus::Pending,
            started_at: None,
            ended_at: None,
            metadata,
        };

        {
            let mut streams = self.streams.write().await;
            streams.insert(stream_id.clone(), record);
        }

        let kv_key = stream_key_kv_key(tenant_id, &stream_id);
        if let Err(e) = self.kv.set_ex(&kv_key, self.stream_key_ttl, &stream_key).await {
            let mut streams = self.streams.write().await;
            streams.remove(&stream_id);
            return Err(e);
        }

        info!(stream_id = %stream_id, tenant_id = %tenant_id, "stream created");
        Ok((stream_id, stream_key))
    }

    /// Constant-time compare against the KV-stored key. Missing entry or
    /// empty candidate key are both `false`, never an error.
    pub async fn validate_stream_key(&self, tenant_id: &str, stream_id: &str, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        let kv_key = stream_key_kv_key(tenant_id, stream_id);
        match self.kv.get(&kv_key).await {
            Ok(Some(stored)) => constant_time_eq(stored.as_bytes(), key.as_bytes()),
            Ok(None) => false,
            Err(e) => {
                warn!(%stream_id, error = %e, "kv error validating stream key");
                false
            }
        }
    }

    /// pending -> live. Writes `started_at` and mirrors the record into the
    /// `active_streams` KV hash. Does not allow live -> live (idempotency is
    /// the caller's job, per spec §4.1).
    pub async fn start_stream(&self, stream_id: &str) -> Result<bool> {
        let mut streams = self.streams.write().await;
        let Some(record) = streams.get_mut(stream_id) else {
            return Ok(false);
        };
        if record.status != StreamStatus::Pending {
            return Ok(false);
        }
        let previous = record.clone();
        record.status = StreamStatus::Live;
        record.started_at = Some(now_epoch_secs());
        let updated = record.clone();
        drop(streams);

        let serialized = serde_json::to_string(&updated).map_err(|e| {
            OrchestratorError::Kv(format!("failed to serialize stream record: {e}"))
        })?;
        if let Err(e) = self
            .kv
            .h_set(ACTIVE_STREAMS_HASH, stream_id, &serialized)
            .await
        {
            let mut streams = self.streams.write().await;
            streams.insert(stream_id.to_string(), previous);
            return Err(e);
        }

        self.refresh_active_streams_gauge().await;
        info!(%stream_id, "stream started");
        Ok(true)
    }

    /// live/pending -> ended. Removes the KV hash entry and the stream-key
    /// entry. Returns `false` if the stream is unknown.
    pub async fn end_stream(&self, stream_id: &str) -> Result<bool> {
        let mut streams = self.streams.write().await;
        let Some(record) = streams.get_mut(stream_id) else {
            return Ok(false);
        };
        if record.status == StreamStatus::Ended {
            return Ok(false);
        }
        let tenant_id = record.tenant_id.clone();
        record.status = StreamStatus::Ended;
        record.ended_at = Some(now_epoch_secs());
        drop(streams);

        self.kv.h_del(ACTIVE_STREAMS_HASH, stream_id).await?;
        self.kv
            .del(&stream_key_kv_key(&tenant_id, stream_id))
            .await?;

        self.refresh_active_streams_gauge().await;
        info!(%stream_id, "stream ended");
        Ok(true)
    }

    /// Sets `ACTIVE_STREAMS` to this worker's local live count (spec's
    /// "active stream count" metric). Worker-local like the rest of this
    /// struct's in-memory state (design note 9.3); it is not a cross-worker
    /// total.
    async fn refresh_active_streams_gauge(&self) {
        let live = self
            .streams
            .read()
            .await
            .values()
            .filter(|r| r.status == StreamStatus::Live)
            .count();
        ACTIVE_STREAMS.set(live as f64);
    }

    pub async fn get_stream(&self, stream_id: &str) -> Option<StreamRecord> {
        self.streams.read().await.get(stream_id).cloned()
    }

    pub async fn get_live_streams(&self, tenant_id: &str) -> Vec<StreamRecord> {
        self.streams
            .read()
            .await
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.status == StreamStatus::Live)
            .cloned()
            .collect()
    }

    /// Reads the KV-mirrored `active_streams` hash rather than local state,
    /// since other workers' live streams never appear in the local map
    /// (design note 9.3).
    pub async fn get_all_active_streams(&self) -> Result<Vec<StreamRecord>> {
        let raw = self.kv.h_get_all(ACTIVE_STREAMS_HASH).await?;
        let mut out = Vec::with_capacity(raw.len());
        for value in raw.values() {
            match serde_json::from_str::<StreamRecord>(value) {
                Ok(record) => out.push(record),
                Err(e) => warn!(error = %e, "skipping malformed active_streams entry"),
            }
        }
        Ok(out)
    }

    pub async fn stats(&self) -> StreamManagerStats {
        let streams = self.streams.read().await;
        let mut stats = StreamManagerStats {
            total_known: streams.len(),
            ..Default::default()
        };
        for record in streams.values() {
            match record.status {
                StreamStatus::Live => stats.live += 1,
                StreamStatus::Pending => stats.pending += 1,
                StreamStatus::Ended => stats.ended += 1,
            }
        }
        stats
    }
}

#[async_trait]
impl StreamKeyValidator for StreamManager {
    async fn validate_stream_key(&self, tenant_id: &str, stream_id: &str, key: &str) -> bool {
        StreamManager::validate_stream_key(self, tenant_id, stream_id, key).await
    }
}

/// Avoids leaking key-length/content via timing differences; stream keys
/// are secrets even though they're just hex tokens.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn manager() -> StreamManager {
        StreamManager::new(Arc::new(MemoryKv::new()), 86_400)
    }

    #[tokio::test]
    async fn create_then_validate_round_trips() {
        let mgr = manager();
        let (stream_id, key) = mgr
            .create_stream("tenant-a", "user-1", "t", HashMap::new())
            .await
            .unwrap();
        assert!(mgr.validate_stream_key("tenant-a", &stream_id, &key).await);
        assert!(!mgr.validate_stream_key("tenant-a", &stream_id, "sk_wrong").await);
        assert!(!mgr.validate_stream_key("tenant-a", &stream_id, "").await);
    }

    #[tokio::test]
    async fn start_then_appears_in_active_streams() {
        let mgr = manager();
        let (stream_id, _key) = mgr
            .create_stream("tenant-a", "user-1", "t", HashMap::new())
            .await
            .unwrap();
        assert!(mgr.start_stream(&stream_id).await.unwrap());
        assert!(!mgr.start_stream(&stream_id).await.unwrap());

        let active = mgr.get_all_active_streams().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].stream_id, stream_id);
        assert_eq!(active[0].status, StreamStatus::Live);
    }

    #[tokio::test]
    async fn end_removes_from_active_and_stream_key() {
        let mgr = manager();
        let (stream_id, key) = mgr
            .create_stream("tenant-a", "user-1", "t", HashMap::new())
            .await
            .unwrap();
        mgr.start_stream(&stream_id).await.unwrap();
        assert!(mgr.end_stream(&stream_id).await.unwrap());
        assert!(!mgr.end_stream(&stream_id).await.unwrap());

        let active = mgr.get_all_active_streams().await.unwrap();
        assert!(active.is_empty());
        assert!(!mgr.validate_stream_key("tenant-a", &stream_id, &key).await);
    }

    #[tokio::test]
    async fn unknown_stream_operations_return_false() {
        let mgr = manager();
        assert!(!mgr.start_stream("stream_doesnotexist").await.unwrap());
        assert!(!mgr.end_stream("stream_doesnotexist").await.unwrap());
    }
}
