// src/scheduler.rs
//
// =============================================================================
// CONDUCTOR: SCHEDULER (v 0.1)
// =============================================================================
//
// Single-writer by design — the daemon boots one scheduler process per
// cluster and loops its main tick every `check_interval`, reserving and
// dispatching FIFO-ordered pending jobs that fit in available capacity.
//
// No release-on-complete path lives here. Reconciling terminal jobs with
// lingering allocations belongs solely to `CompletedJobCleanup` in the
// cleanup engine, so there is exactly one place that can release a job's
// resources.

use crate::cleanup::CleanupManager;
use crate::db::models::NewJob;
use crate::db::{allocation_repository, job_repository, DbPool};
use crate::error::Result;
use crate::queue::{DispatchToken, Queue, EXECUTOR_DISPATCH_TIMEOUT};
use crate::resources::ResourceAccounting;
use std::sync::Arc;
use std::time::Duration;

pub struct Scheduler {
    db: DbPool,
    queue: Arc<dyn Queue>,
    accounting: Arc<ResourceAccounting>,
    node_name: String,
    cleanup: CleanupManager,
    check_interval: Duration,
}

impl Scheduler {
    pub fn new(
        db: DbPool,
        queue: Arc<dyn Queue>,
        accounting: Arc<ResourceAccounting>,
        node_name: String,
        cleanup: CleanupManager,
        check_interval: Duration,
    ) -> Self {
        Self {
            db,
            queue,
            accounting,
            node_name,
            cleanup,
            check_interval,
        }
    }

    /// Submits a new PENDING job on behalf of the API front-end and
    /// enqueues nothing — the job becomes visible to the next scheduling
    /// tick via its PENDING state.
    pub fn submit(&self, new_job: NewJob) -> Result<i64> {
        let conn = self.db.get()?;
        job_repository::insert(&conn, &new_job)
    }

    /// Runs the main loop forever. A per-tick failure is logged and the
    /// loop continues rather than terminating the daemon.
    pub async fn run(&mut self) -> ! {
        let conn = self.db.get().expect("initial db connection");
        if let Err(err) = self.accounting.sync_from_db(&conn).await {
            log::error!("initial cache sync failed: {err}");
        }
        drop(conn);

        loop {
            if let Err(err) = self.tick().await {
                log::error!("scheduler tick failed: {err}");
            }
            tokio::time::sleep(self.check_interval).await;
        }
    }

    /// One scheduling pass: read capacity, reserve and dispatch what fits,
    /// then hand off to the cleanup engine.
    pub async fn tick(&mut self) -> Result<()> {
        let mut conn = self.db.get()?;

        let total = self.accounting.total_cpus().await? as i64;
        if total == 0 {
            log::debug!("no live workers registered, skipping dispatch this tick");
        } else {
            let mut available = total - self.accounting.allocated_cpus(&conn).await?;
            let pending = job_repository::list_pending_fifo(&conn)?;

            for job in pending {
                let need = job.total_cpus();
                if need > available {
                    // No compaction: a large head-of-line job blocks smaller
                    // followers intentionally.
                    continue;
                }

                // Steps b-c run inside one transaction: if mark_running
                // failed after reserve committed, the job would be left
                // PENDING with a dangling RESERVED allocation that no
                // cleanup strategy reclaims (StaleReservationCleanup only
                // looks at RUNNING jobs).
                let tx = conn.transaction()?;
                allocation_repository::reserve(&tx, job.id, need, &self.node_name)?;
                job_repository::mark_running(&tx, job.id, &self.node_name)?;
                tx.commit()?;

                if let Err(err) = self
                    .queue
                    .enqueue(DispatchToken::execute_job(
                        job.id,
                        EXECUTOR_DISPATCH_TIMEOUT.as_secs(),
                    ))
                    .await
                {
                    // Tolerated: StaleReservationCleanup releases the
                    // reservation and fails the job after its grace window.
                    log::warn!("failed to enqueue dispatch token for job {}: {err}", job.id);
                }

                available -= need;
            }
        }

        self.cleanup.tick(&mut conn, &self.accounting).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::CleanupConfig;
    use crate::db::open_memory_pool_for_tests;
    use crate::kv::InMemoryKv;
    use crate::queue::InMemoryQueue;
    use crate::registry::WorkerRegistry;
    use std::collections::HashMap;

    fn job_needing(cpus: i64) -> NewJob {
        NewJob {
            account: "alice".into(),
            name: "t".into(),
            partition: "default".into(),
            script: "exit 0".into(),
            working_directory: "/tmp".into(),
            stdout_path: "o".into(),
            stderr_path: "e".into(),
            environment: HashMap::new(),
            tasks_per_node: 1,
            cpus_per_task: cpus,
            memory_per_node: "1G".into(),
            time_limit_minutes: None,
            exclusive: false,
            data_source: "api".into(),
        }
    }

    async fn scheduler_with_capacity(cpus: u32) -> Scheduler {
        let db = open_memory_pool_for_tests();
        let kv: Arc<dyn crate::kv::Kv> = Arc::new(InMemoryKv::new());
        let registry = Arc::new(WorkerRegistry::new(kv.clone(), Duration::from_secs(30)));
        registry.register("w0", cpus, "host0").await.unwrap();
        let accounting = Arc::new(ResourceAccounting::new(kv, registry, cpus));
        let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
        let cleanup = CleanupManager::with_defaults(CleanupConfig {
            stale_reservation_minutes: 10,
            stuck_job_hours: 48,
            old_job_days: 30,
            old_job_cleanup_enabled: false,
        });
        Scheduler::new(db, queue, accounting, "node0".into(), cleanup, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn fifo_head_of_line_blocks_smaller_follower() {
        let mut scheduler = scheduler_with_capacity(4).await;
        let a = scheduler.submit(job_needing(4)).unwrap();
        let b = scheduler.submit(job_needing(1)).unwrap();
        scheduler.tick().await.unwrap();

        let conn = scheduler.db.get().unwrap();
        let job_a = job_repository::get(&conn, a).unwrap();
        let job_b = job_repository::get(&conn, b).unwrap();
        assert_eq!(job_a.state, crate::db::models::JobState::Running);
        assert_eq!(job_b.state, crate::db::models::JobState::Pending);
    }

    #[tokio::test]
    async fn job_exceeding_total_capacity_never_schedules() {
        let mut scheduler = scheduler_with_capacity(2).await;
        let id = scheduler.submit(job_needing(4)).unwrap();
        scheduler.tick().await.unwrap();
        scheduler.tick().await.unwrap();

        let conn = scheduler.db.get().unwrap();
        let job = job_repository::get(&conn, id).unwrap();
        assert_eq!(job.state, crate::db::models::JobState::Pending);
    }
}
