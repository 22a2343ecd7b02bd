// src/heartbeat.rs
//
// =============================================================================
// CONDUCTOR: WORKER HEARTBEAT (v 0.1)
// =============================================================================
//
// A cooperative loop with a stoppable wait. Registers once on worker boot,
// then refreshes the K/V TTL every heartbeat-interval until told to stop,
// at which point it deletes its own key (graceful shutdown).

use crate::registry::{WorkerRegistry, WorkerStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct Heartbeat {
    registry: Arc<WorkerRegistry>,
    worker_id: String,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(registry: Arc<WorkerRegistry>, worker_id: String, interval: Duration) -> Self {
        Self {
            registry,
            worker_id,
            interval,
        }
    }

    /// Registers the worker and spawns the refresh loop. Returns a sender
    /// that, when dropped or sent `true`, causes the loop to unregister and
    /// exit.
    pub async fn start(&self, cpus: u32, hostname: &str) -> crate::error::Result<watch::Sender<bool>> {
        self.registry.register(&self.worker_id, cpus, hostname).await?;

        let (tx, mut rx) = watch::channel(false);
        let registry = self.registry.clone();
        let worker_id = self.worker_id.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = registry.heartbeat(&worker_id).await {
                            log::warn!("heartbeat refresh failed for {worker_id}: {err}");
                        }
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            if let Err(err) = registry.unregister(&worker_id).await {
                log::warn!("failed to unregister {worker_id} on shutdown: {err}");
            }
        });

        Ok(tx)
    }

    pub async fn mark_busy(&self) -> crate::error::Result<()> {
        self.registry.update_status(&self.worker_id, WorkerStatus::Busy).await
    }

    pub async fn mark_ready(&self) -> crate::error::Result<()> {
        self.registry.update_status(&self.worker_id, WorkerStatus::Ready).await
    }
}
