// tests/scheduling_scenarios.rs
//
// End-to-end scheduling/execution/cleanup scenarios driven directly against
// the library, using a real on-disk SQLite database (`tempfile`) and the
// in-memory `Kv`/`Queue` fakes so no Redis is needed — the scheduling logic
// under test is identical to production, only the store's transport
// differs.

use conductor::cleanup::{CleanupConfig, CleanupManager};
use conductor::db::models::{exit_code, AllocationStatus, JobState, NewJob};
use conductor::db::{allocation_repository, job_repository, DbPool};
use conductor::executor::Executor;
use conductor::kv::{InMemoryKv, Kv};
use conductor::queue::{InMemoryQueue, Queue};
use conductor::registry::WorkerRegistry;
use conductor::{ResourceAccounting, Scheduler};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

fn job_needing(cpus: i64, script: &str, work_dir: &std::path::Path) -> NewJob {
    NewJob {
        account: "alice".into(),
        name: "t".into(),
        partition: "default".into(),
        script: script.to_string(),
        working_directory: work_dir.to_string_lossy().into_owned(),
        stdout_path: "stdout.log".into(),
        stderr_path: "stderr.log".into(),
        environment: HashMap::new(),
        tasks_per_node: 1,
        cpus_per_task: cpus,
        memory_per_node: "256M".into(),
        time_limit_minutes: Some(1),
        exclusive: false,
        data_source: "api".into(),
    }
}

/// Shared fixture: a real sqlite-backed db, an in-memory kv/queue pair, one
/// registered worker advertising `total_cpus`, and scheduler+executor wired
/// against them exactly as `main.rs` wires the real roles.
struct Harness {
    scheduler: Scheduler,
    db: DbPool,
    accounting: Arc<ResourceAccounting>,
    _scratch: TempDir,
}

async fn harness(total_cpus: u32) -> Harness {
    let scratch = tempdir().unwrap();
    let db_path = scratch.path().join("conductor.sqlite3");
    let db = conductor::db::open_pool(db_path.to_str().unwrap()).unwrap();

    let kv: Arc<dyn Kv> = Arc::new(InMemoryKv::new());
    let registry = Arc::new(WorkerRegistry::new(kv.clone(), Duration::from_secs(30)));
    registry.register("w0", total_cpus, "host0").await.unwrap();
    let accounting = Arc::new(ResourceAccounting::new(kv, registry, total_cpus));
    let queue: Arc<dyn Queue> = Arc::new(InMemoryQueue::new());
    let cleanup = CleanupManager::with_defaults(CleanupConfig {
        stale_reservation_minutes: 10,
        stuck_job_hours: 48,
        old_job_days: 30,
        old_job_cleanup_enabled: false,
    });

    let scheduler = Scheduler::new(
        db.clone(),
        queue,
        accounting.clone(),
        "node0".into(),
        cleanup,
        Duration::from_secs(5),
    );

    Harness {
        scheduler,
        db,
        accounting,
        _scratch: scratch,
    }
}

impl Harness {
    fn executor(&self, work_dir: &std::path::Path) -> Executor {
        Executor::new(
            self.db.clone(),
            self.accounting.clone(),
            "node0".into(),
            work_dir.to_path_buf(),
            work_dir.to_path_buf(),
        )
    }
}

/// Happy path: submit, schedule, execute, completes
/// with the allocation released and the cache back at zero.
#[tokio::test]
async fn happy_path_reaches_completed_with_released_allocation() {
    let mut h = harness(4).await;
    let wd = tempdir().unwrap();
    let executor = h.executor(wd.path());

    let job_id = h.scheduler.submit(job_needing(2, "exit 0", wd.path())).unwrap();
    h.scheduler.tick().await.unwrap();
    {
        let conn = h.db.get().unwrap();
        assert_eq!(job_repository::get(&conn, job_id).unwrap().state, JobState::Running);
    }

    executor.execute(job_id).await.unwrap();

    let conn = h.db.get().unwrap();
    let job = job_repository::get(&conn, job_id).unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.exit_code.as_deref(), Some("0:0"));
    let alloc = allocation_repository::get_by_job(&conn, job_id).unwrap().unwrap();
    assert_eq!(alloc.status, AllocationStatus::Released);
    drop(conn);
    assert_eq!(h.accounting.sync_from_db(&h.db.get().unwrap()).await.unwrap(), 0);
}

/// FIFO head-of-line — a large job at the head blocks
/// a smaller follower until it completes; no compaction around it.
#[tokio::test]
async fn fifo_head_of_line_blocks_smaller_follower_until_capacity_frees() {
    let mut h = harness(4).await;
    let wd = tempdir().unwrap();
    let executor = h.executor(wd.path());

    let a = h.scheduler.submit(job_needing(4, "exit 0", wd.path())).unwrap();
    let b = h.scheduler.submit(job_needing(1, "exit 0", wd.path())).unwrap();

    h.scheduler.tick().await.unwrap();
    {
        let conn = h.db.get().unwrap();
        assert_eq!(job_repository::get(&conn, a).unwrap().state, JobState::Running);
        assert_eq!(job_repository::get(&conn, b).unwrap().state, JobState::Pending);
    }

    executor.execute(a).await.unwrap();
    h.scheduler.tick().await.unwrap();

    let conn = h.db.get().unwrap();
    assert_eq!(job_repository::get(&conn, b).unwrap().state, JobState::Running);
}

/// Cancelling a running job signals its process
/// group; the executor's wait loop observes the signal death, records the
/// cancelled exit code, and still releases the allocation.
#[tokio::test]
async fn cancel_during_run_is_recorded_and_releases() {
    let mut h = harness(4).await;
    let wd = tempdir().unwrap();

    let job_id = h.scheduler.submit(job_needing(1, "sleep 30", wd.path())).unwrap();
    h.scheduler.tick().await.unwrap();

    let executor = h.executor(wd.path());
    let exec_task = tokio::spawn(async move { executor.execute(job_id).await });

    // Give the child time to spawn and record its PID before cancelling.
    let mut pid = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let conn = h.db.get().unwrap();
        if let Some(alloc) = allocation_repository::get_by_job(&conn, job_id).unwrap() {
            if alloc.process_id.is_some() {
                pid = alloc.process_id;
                break;
            }
        }
    }
    let pid = pid.expect("job should have spawned a process within 1s");
    conductor::executor::process::send_sigterm_to_group(pid);

    exec_task.await.unwrap().unwrap();

    let conn = h.db.get().unwrap();
    let job = job_repository::get(&conn, job_id).unwrap();
    assert!(matches!(job.state, JobState::Failed | JobState::Cancelled));
    let alloc = allocation_repository::get_by_job(&conn, job_id).unwrap().unwrap();
    assert_eq!(alloc.status, AllocationStatus::Released);
}

/// A reservation that ages past the stale window
/// while its job is still RUNNING (dispatch token lost, worker never
/// started) is failed by `StaleReservationCleanup` with no cache delta.
#[tokio::test]
async fn stale_reservation_fails_job_without_ever_touching_the_cache() {
    let mut h = harness(4).await;
    let wd = tempdir().unwrap();
    let job_id = h.scheduler.submit(job_needing(2, "exit 0", wd.path())).unwrap();

    {
        let conn = h.db.get().unwrap();
        job_repository::mark_running(&conn, job_id, "node0").unwrap();
        allocation_repository::reserve(&conn, job_id, 2, "node0").unwrap();
        conn.execute(
            "UPDATE resource_allocations SET allocation_time = ?1 WHERE job_id = ?2",
            rusqlite::params![chrono::Utc::now() - chrono::Duration::minutes(11), job_id],
        )
        .unwrap();
    }

    // StaleReservationCleanup only becomes eligible after CompletedJobCleanup
    // has run at least once (its `depends_on`), and not before its own
    // 120s interval has elapsed since manager construction — it runs on the
    // very first tick since `last_run` starts empty.
    h.scheduler.tick().await.unwrap();

    let conn = h.db.get().unwrap();
    let job = job_repository::get(&conn, job_id).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.exit_code.as_deref(), Some(exit_code::STALE_RESERVATION));
    let alloc = allocation_repository::get_by_job(&conn, job_id).unwrap().unwrap();
    assert_eq!(alloc.status, AllocationStatus::Released);
    drop(conn);
    assert_eq!(h.accounting.sync_from_db(&h.db.get().unwrap()).await.unwrap(), 0);
}

/// Dynamic capacity — a second worker's TTL expiring
/// shrinks `total_cpus()`, and the scheduler will not dispatch beyond the
/// new, smaller capacity.
#[tokio::test]
async fn shrinking_worker_set_reduces_dispatchable_capacity() {
    let kv: Arc<dyn Kv> = Arc::new(InMemoryKv::new());
    let registry = Arc::new(WorkerRegistry::new(kv.clone(), Duration::from_millis(20)));
    registry.register("w0", 4, "host0").await.unwrap();
    registry.register("w1", 4, "host1").await.unwrap();
    assert_eq!(registry.total_cpus().await.unwrap(), 8);

    // w1's TTL (2x the 20ms heartbeat interval) lapses without a refresh;
    // w0 keeps refreshing, so only w1 drops out of the live set.
    tokio::time::sleep(Duration::from_millis(60)).await;
    registry.heartbeat("w0").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(registry.total_cpus().await.unwrap(), 4);
}
