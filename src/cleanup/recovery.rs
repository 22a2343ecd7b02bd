// src/cleanup/recovery.rs
//
// =============================================================================
// CONDUCTOR: WORKER STARTUP RECOVERY (v 0.1)
// =============================================================================
//
// Worker startup recovery — distinct from the periodic cleanup engine,
// runs once when a worker process boots. Ordered pipeline: re-enqueue
// PENDING jobs, fail RUNNING jobs whose PID vanished, fail RUNNING jobs
// that exceeded a max runtime, and release any allocation left stale
// beyond a longer horizon than the periodic `StaleReservationCleanup`.

use crate::db::models::{exit_code, AllocationStatus, JobState};
use crate::db::{allocation_repository, job_repository};
use crate::error::Result;
use crate::queue::{DispatchToken, Queue, EXECUTOR_DISPATCH_TIMEOUT};
use crate::resources::ResourceAccounting;
use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::Connection;
use std::sync::Arc;

/// Re-enqueues a dispatch token for every PENDING job, relying on the
/// queue's own RQ-style de-duplication by deterministic token id so a job
/// already in flight is not duplicated.
pub async fn pending_job_recovery(conn: &Connection, queue: &dyn Queue) -> Result<usize> {
    let pending = job_repository::list_by_state(conn, JobState::Pending)?;
    for job in &pending {
        queue
            .enqueue(DispatchToken::execute_job(
                job.id,
                EXECUTOR_DISPATCH_TIMEOUT.as_secs(),
            ))
            .await?;
    }
    Ok(pending.len())
}

/// Fails RUNNING jobs whose recorded PID no longer exists on this host —
/// evidence the worker that was executing them crashed mid-run.
pub async fn orphan_job_recovery(conn: &Connection, accounting: &ResourceAccounting) -> Result<usize> {
    let running = job_repository::list_by_state(conn, JobState::Running)?;
    let mut repaired = 0;
    for job in running {
        let Some(alloc) = allocation_repository::get_by_job(conn, job.id)? else {
            continue;
        };
        let Some(pid) = alloc.process_id else { continue };
        if alloc.status != AllocationStatus::Allocated {
            continue;
        }
        if process_exists(pid) {
            continue;
        }
        job_repository::mark_terminal(
            conn,
            job.id,
            JobState::Failed,
            exit_code::ORPHAN_RECOVERY,
            Some("worker crash detected on recovery"),
        )?;
        if let Some((prior, cpus)) = allocation_repository::release(conn, job.id)? {
            if prior == AllocationStatus::Allocated {
                accounting.release(cpus).await?;
            }
        }
        repaired += 1;
    }
    Ok(repaired)
}

/// Fails RUNNING jobs that have exceeded a configured max-runtime, distinct
/// from `StuckJobCleanup`'s longer periodic horizon — this runs once at
/// worker boot with a recovery-specific threshold.
pub async fn timeout_job_recovery(
    conn: &Connection,
    accounting: &ResourceAccounting,
    max_age_hours: i64,
) -> Result<usize> {
    let cutoff = Utc::now() - ChronoDuration::hours(max_age_hours);
    let running = job_repository::list_by_state(conn, JobState::Running)?;
    let mut repaired = 0;
    for job in running {
        let Some(start) = job.start_time else { continue };
        if start >= cutoff {
            continue;
        }
        job_repository::mark_terminal(
            conn,
            job.id,
            JobState::Failed,
            exit_code::TIMEOUT_RECOVERY,
            Some("job exceeded the maximum allowed runtime (recovered at worker boot)"),
        )?;
        if let Some((prior, cpus)) = allocation_repository::release(conn, job.id)? {
            if prior == AllocationStatus::Allocated {
                accounting.release(cpus).await?;
            }
        }
        repaired += 1;
    }
    Ok(repaired)
}

/// Mirrors the periodic `StaleReservationCleanup` with a longer horizon
/// (48h default) — a boot-time safety net for reservations the periodic
/// strategy's shorter window should already have caught.
pub async fn stale_allocation_cleanup(
    conn: &Connection,
    max_age_hours: i64,
) -> Result<usize> {
    let cutoff = Utc::now() - ChronoDuration::hours(max_age_hours);
    let stale = allocation_repository::list_stale_reservations(conn, cutoff)?;
    let mut repaired = 0;
    for (_alloc, job_id) in stale {
        job_repository::mark_terminal(
            conn,
            job_id,
            JobState::Failed,
            exit_code::STALE_RESERVATION,
            Some("reservation timed out, queue lost or worker not starting"),
        )?;
        allocation_repository::release(conn, job_id)?;
        repaired += 1;
    }
    Ok(repaired)
}

/// Runs the full ordered pipeline once at worker boot.
pub async fn run_all(
    conn: &Connection,
    queue: &dyn Queue,
    accounting: &ResourceAccounting,
    worker_timeout_recovery_hours: i64,
) -> Result<()> {
    let pending = pending_job_recovery(conn, queue).await?;
    let orphaned = orphan_job_recovery(conn, accounting).await?;
    let timed_out = timeout_job_recovery(conn, accounting, worker_timeout_recovery_hours).await?;
    let stale = stale_allocation_cleanup(conn, worker_timeout_recovery_hours).await?;
    log::info!(
        "startup recovery: {pending} pending re-enqueued, {orphaned} orphans, \
         {timed_out} timed out, {stale} stale allocations released"
    );
    Ok(())
}

#[cfg(unix)]
fn process_exists(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn process_exists(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{job_repository, models::NewJob, open_memory_pool_for_tests};
    use crate::kv::InMemoryKv;
    use crate::queue::InMemoryQueue;
    use crate::registry::WorkerRegistry;
    use std::collections::HashMap;
    use std::time::Duration;

    fn sample_job() -> NewJob {
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
            cpus_per_task: 2,
            memory_per_node: "1G".into(),
            time_limit_minutes: None,
            exclusive: false,
            data_source: "api".into(),
        }
    }

    #[tokio::test]
    async fn orphan_recovery_fails_job_whose_pid_is_gone() {
        let pool = open_memory_pool_for_tests();
        let conn = pool.get().unwrap();
        let kv: Arc<dyn crate::kv::Kv> = Arc::new(InMemoryKv::new());
        let registry = Arc::new(WorkerRegistry::new(kv.clone(), Duration::from_secs(30)));
        let accounting = ResourceAccounting::new(kv, registry, 8);

        let job_id = job_repository::insert(&conn, &sample_job()).unwrap();
        job_repository::mark_running(&conn, job_id, "n0").unwrap();
        allocation_repository::reserve(&conn, job_id, 2, "n0").unwrap();
        allocation_repository::promote_to_allocated(&conn, job_id).unwrap();
        allocation_repository::set_process_id(&conn, job_id, i32::MAX - 1).unwrap();

        let count = orphan_job_recovery(&conn, &accounting).await.unwrap();
        assert_eq!(count, 1);
        let job = job_repository::get(&conn, job_id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.exit_code.as_deref(), Some(exit_code::ORPHAN_RECOVERY));
    }

    #[tokio::test]
    async fn pending_job_recovery_reenqueues_every_pending_job() {
        let pool = open_memory_pool_for_tests();
        let conn = pool.get().unwrap();
        let queue = InMemoryQueue::new();
        job_repository::insert(&conn, &sample_job()).unwrap();
        job_repository::insert(&conn, &sample_job()).unwrap();
        let count = pending_job_recovery(&conn, &queue).await.unwrap();
        assert_eq!(count, 2);
        assert!(queue.dequeue().await.unwrap().is_some());
        assert!(queue.dequeue().await.unwrap().is_some());
    }
}
