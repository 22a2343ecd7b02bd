// src/registry.rs
//
// =============================================================================
// CONDUCTOR: WORKER REGISTRY & HEARTBEAT (v 0.1)
// =============================================================================
//
// The live-worker set lives entirely in the K/V store under `worker:<id>`
// hash keys with a TTL of 2x the heartbeat interval, so a crashed worker
// silently drops out of `total_cpus()` within one TTL window with no
// explicit failure detection needed.

use crate::error::Result;
use crate::kv::Kv;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

const KEY_PREFIX: &str = "worker:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Ready,
    Busy,
    Stopping,
}

impl WorkerStatus {
    fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Ready => "ready",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Stopping => "stopping",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "busy" => WorkerStatus::Busy,
            "stopping" => WorkerStatus::Stopping,
            _ => WorkerStatus::Ready,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub cpus: u32,
    pub hostname: String,
    pub status: WorkerStatus,
    pub registered_at: String,
    pub last_heartbeat: String,
}

pub struct WorkerRegistry {
    kv: Arc<dyn Kv>,
    ttl: Duration,
}

impl WorkerRegistry {
    pub fn new(kv: Arc<dyn Kv>, heartbeat_interval: Duration) -> Self {
        Self {
            kv,
            ttl: heartbeat_interval * 2,
        }
    }

    fn key(worker_id: &str) -> String {
        format!("{KEY_PREFIX}{worker_id}")
    }

    pub async fn register(&self, worker_id: &str, cpus: u32, hostname: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let key = Self::key(worker_id);
        self.kv
            .hset(
                &key,
                &[
                    ("worker_id", worker_id),
                    ("cpus", &cpus.to_string()),
                    ("hostname", hostname),
                    ("status", WorkerStatus::Ready.as_str()),
                    ("registered_at", &now),
                    ("last_heartbeat", &now),
                ],
            )
            .await?;
        self.kv.expire(&key, self.ttl.as_secs()).await?;
        Ok(())
    }

    /// Refreshes the TTL and `last_heartbeat` timestamp; tolerates one
    /// missed refresh before the key expires.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        let key = Self::key(worker_id);
        let now = Utc::now().to_rfc3339();
        self.kv.hset(&key, &[("last_heartbeat", &now)]).await?;
        self.kv.expire(&key, self.ttl.as_secs()).await?;
        Ok(())
    }

    pub async fn update_status(&self, worker_id: &str, status: WorkerStatus) -> Result<()> {
        let key = Self::key(worker_id);
        self.kv.hset(&key, &[("status", status.as_str())]).await?;
        Ok(())
    }

    pub async fn unregister(&self, worker_id: &str) -> Result<()> {
        self.kv.delete(&Self::key(worker_id)).await
    }

    pub async fn list_live_workers(&self) -> Result<Vec<WorkerRecord>> {
        let keys = self.kv.keys(KEY_PREFIX).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let fields = self.kv.hgetall(&key).await?;
            if fields.is_empty() {
                continue;
            }
            out.push(WorkerRecord {
                worker_id: fields.get("worker_id").cloned().unwrap_or_default(),
                cpus: fields.get("cpus").and_then(|v| v.parse().ok()).unwrap_or(0),
                hostname: fields.get("hostname").cloned().unwrap_or_default(),
                status: fields
                    .get("status")
                    .map(|s| WorkerStatus::parse(s))
                    .unwrap_or(WorkerStatus::Ready),
                registered_at: fields.get("registered_at").cloned().unwrap_or_default(),
                last_heartbeat: fields.get("last_heartbeat").cloned().unwrap_or_default(),
            });
        }
        Ok(out)
    }

    pub async fn total_cpus(&self) -> Result<u32> {
        Ok(self.list_live_workers().await?.iter().map(|w| w.cpus).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    #[tokio::test]
    async fn total_cpus_sums_live_workers() {
        let registry = WorkerRegistry::new(Arc::new(InMemoryKv::new()), Duration::from_secs(30));
        registry.register("w1", 4, "host1").await.unwrap();
        registry.register("w2", 8, "host2").await.unwrap();
        assert_eq!(registry.total_cpus().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn unregister_removes_worker_from_total() {
        let registry = WorkerRegistry::new(Arc::new(InMemoryKv::new()), Duration::from_secs(30));
        registry.register("w1", 4, "host1").await.unwrap();
        registry.unregister("w1").await.unwrap();
        assert_eq!(registry.total_cpus().await.unwrap(), 0);
    }
}
