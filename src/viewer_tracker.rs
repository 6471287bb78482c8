//! Viewer Tracker (C1) — per-stream live viewer set with TTL expiry, backed
//! by the KV store's sorted-set capability (spec §3, §4.5). Grounded on
//! `manager.rs`'s idle-cleanup spawned task for the "drop after silence"
//! shape, adapted here to a lazy evict-on-read policy since presence lives
//! in KV rather than a worker-local map.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::kv::KvStore;
use crate::metrics::STREAM_VIEWER_COUNT;

pub const VIEWER_TTL_SECS: u64 = 30;

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn viewers_key(tenant_id: &str, stream_id: &str) -> String {
    format!("stream_viewers:{tenant_id}:{stream_id}")
}

pub struct ViewerTracker {
    kv: Arc<dyn KvStore>,
}

impl ViewerTracker {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Upserts the viewer's score to now and refreshes the key's own TTL to
    /// 4·VIEWER_TTL so the set self-cleans after silence (spec I7).
    pub async fn heartbeat(&self, tenant_id: &str, stream_id: &str, viewer_id: &str) -> Result<()> {
        let key = viewers_key(tenant_id, stream_id);
        self.kv.z_add(&key, now_epoch_secs() as f64, viewer_id).await?;
        self.kv.expire(&key, VIEWER_TTL_SECS * 4).await?;
        Ok(())
    }

    pub async fn remove(&self, tenant_id: &str, stream_id: &str, viewer_id: &str) -> Result<()> {
        self.kv.z_rem(&viewers_key(tenant_id, stream_id), viewer_id).await
    }

    /// Evicts stale members (score <= now - VIEWER_TTL) before counting, per
    /// spec I6/§4.5.
    async fn evict_stale(&self, tenant_id: &str, stream_id: &str) -> Result<()> {
        let key = viewers_key(tenant_id, stream_id);
        // I6: scores strictly less than the cutoff are stale; a score equal
        // to the cutoff is still within the window.
        let cutoff = now_epoch_secs().saturating_sub(VIEWER_TTL_SECS) as f64;
        self.kv.z_remrangebyscore(&key, f64::MIN, cutoff - 1.0).await
    }

    pub async fn count(&self, tenant_id: &str, stream_id: &str) -> Result<usize> {
        self.evict_stale(tenant_id, stream_id).await?;
        let count = self.kv.z_card(&viewers_key(tenant_id, stream_id)).await?;
        STREAM_VIEWER_COUNT
            .with_label_values(&[tenant_id, stream_id])
            .set(count as f64);
        Ok(count)
    }

    /// Ascending-score (i.e. least-recently-heartbeated first) member list.
    pub async fn get_viewers(&self, tenant_id: &str, stream_id: &str) -> Result<Vec<String>> {
        self.evict_stale(tenant_id, stream_id).await?;
        self.kv.z_range(&viewers_key(tenant_id, stream_id), 0, -1).await
    }

    pub async fn clear_stream(&self, tenant_id: &str, stream_id: &str) -> Result<()> {
        self.kv.del(&viewers_key(tenant_id, stream_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn tracker() -> ViewerTracker {
        ViewerTracker::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn heartbeat_then_count_is_at_least_one() {
        let t = tracker();
        t.heartbeat("tenant-a", "stream_1", "viewer-1").await.unwrap();
        assert_eq!(t.count("tenant-a", "stream_1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remove_drops_viewer_immediately() {
        let t = tracker();
        t.heartbeat("tenant-a", "stream_1", "viewer-1").await.unwrap();
        t.remove("tenant-a", "stream_1", "viewer-1").await.unwrap();
        assert_eq!(t.count("tenant-a", "stream_1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_stream_removes_all_viewers() {
        let t = tracker();
        t.heartbeat("tenant-a", "stream_1", "viewer-1").await.unwrap();
        t.heartbeat("tenant-a", "stream_1", "viewer-2").await.unwrap();
        t.clear_stream("tenant-a", "stream_1").await.unwrap();
        assert_eq!(t.count("tenant-a", "stream_1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn get_viewers_returns_ascending_score_order() {
        let kv = Arc::new(MemoryKv::new());
        let t = ViewerTracker::new(kv.clone());
        kv.z_add("stream_viewers:tenant-a:stream_1", 100.0, "later")
            .await
            .unwrap();
        kv.z_add("stream_viewers:tenant-a:stream_1", 50.0, "earlier")
            .await
            .unwrap();
        let viewers = t.get_viewers("tenant-a", "stream_1").await.unwrap();
        assert_eq!(viewers, vec!["earlier".to_string(), "later".to_string()]);
    }
}
