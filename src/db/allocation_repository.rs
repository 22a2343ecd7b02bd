// src/db/allocation_repository.rs
//
// ResourceAllocation row access. The status transitions here (RESERVED ->
// ALLOCATED -> RELEASED) are the durable half of the resource-accounting
// model; the cache half lives in `crate::resources`. Callers are
// responsible for updating the cache in the same logical step — this
// module only ever touches the database.

use super::models::AllocationStatus;
use crate::db::models::ResourceAllocation;
use crate::error::{ConductorError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

pub fn reserve(conn: &Connection, job_id: i64, allocated_cpus: i64, node_name: &str) -> Result<i64> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO resource_allocations (job_id, allocated_cpus, node_name, allocation_time, status)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![job_id, allocated_cpus, node_name, now, AllocationStatus::Reserved.as_str()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_by_job(conn: &Connection, job_id: i64) -> Result<Option<ResourceAllocation>> {
    conn.query_row(
        "SELECT * FROM resource_allocations WHERE job_id = ?1",
        params![job_id],
        ResourceAllocation::from_row,
    )
    .optional()
    .map_err(ConductorError::from)
}

/// Promotes RESERVED -> ALLOCATED. The PID is not yet known at this point
/// (SPAWN happens after PROMOTE) and is recorded separately via
/// `set_process_id`. Returns the allocation's status *before* this call so
/// the caller can decide whether the cache needs incrementing.
pub fn promote_to_allocated(conn: &Connection, job_id: i64) -> Result<AllocationStatus> {
    let prior = get_by_job(conn, job_id)?
        .map(|a| a.status)
        .unwrap_or(AllocationStatus::Reserved);
    conn.execute(
        "UPDATE resource_allocations SET status = ?1 WHERE job_id = ?2",
        params![AllocationStatus::Allocated.as_str(), job_id],
    )?;
    Ok(prior)
}

/// Defensive path for step PROMOTE: create an ALLOCATED row directly if none
/// exists yet (should not happen on the happy path).
pub fn create_allocated(
    conn: &Connection,
    job_id: i64,
    allocated_cpus: i64,
    node_name: &str,
) -> Result<()> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO resource_allocations (job_id, allocated_cpus, node_name, allocation_time, status)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![job_id, allocated_cpus, node_name, now, AllocationStatus::Allocated.as_str()],
    )?;
    Ok(())
}

/// Records the spawned PID on the allocation row.
pub fn set_process_id(conn: &Connection, job_id: i64, process_id: i32) -> Result<()> {
    conn.execute(
        "UPDATE resource_allocations SET process_id = ?1 WHERE job_id = ?2",
        params![process_id, job_id],
    )?;
    Ok(())
}

/// Releases the allocation for a job, returning `(prior_status,
/// allocated_cpus)` so the caller can decide the cache delta: decrement
/// iff the prior status was ALLOCATED.
pub fn release(conn: &Connection, job_id: i64) -> Result<Option<(AllocationStatus, i64)>> {
    let Some(alloc) = get_by_job(conn, job_id)? else {
        return Ok(None);
    };
    if alloc.status == AllocationStatus::Released {
        return Ok(Some((alloc.status, alloc.allocated_cpus)));
    }
    let now = Utc::now();
    conn.execute(
        "UPDATE resource_allocations SET status = ?1, released_time = ?2 WHERE job_id = ?3",
        params![AllocationStatus::Released.as_str(), now, job_id],
    )?;
    Ok(Some((alloc.status, alloc.allocated_cpus)))
}

/// Recomputes the authoritative allocated-CPU total: sum of `allocated_cpus`
/// over rows with status = ALLOCATED, not `status != RELEASED` — a RESERVED
/// row was never added to the cache and must not be double counted here
/// either (see DESIGN.md, Open Question 2).
pub fn sum_allocated_cpus(conn: &Connection) -> Result<i64> {
    let sum: Option<i64> = conn.query_row(
        "SELECT SUM(allocated_cpus) FROM resource_allocations WHERE status = ?1",
        params![AllocationStatus::Allocated.as_str()],
        |row| row.get(0),
    )?;
    Ok(sum.unwrap_or(0))
}

/// Allocations reserved for longer than `max_age_minutes` whose job is still
/// RUNNING — feeds `StaleReservationCleanup`.
pub fn list_stale_reservations(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<(ResourceAllocation, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT ra.* FROM resource_allocations ra
         JOIN jobs j ON j.id = ra.job_id
         WHERE ra.status = ?1 AND ra.allocation_time < ?2 AND j.state = ?3",
    )?;
    let rows = stmt
        .query_map(
            params![
                AllocationStatus::Reserved.as_str(),
                cutoff,
                super::models::JobState::Running.as_str()
            ],
            ResourceAllocation::from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(|a| (a.clone(), a.job_id)).collect())
}

/// Allocations belonging to terminal jobs that have not yet been released —
/// feeds `CompletedJobCleanup`.
pub fn list_unreleased_for_terminal_jobs(conn: &Connection) -> Result<Vec<ResourceAllocation>> {
    let mut stmt = conn.prepare(
        "SELECT ra.* FROM resource_allocations ra
         JOIN jobs j ON j.id = ra.job_id
         WHERE ra.status != ?1
           AND j.state IN (?2, ?3, ?4)",
    )?;
    let rows = stmt
        .query_map(
            params![
                AllocationStatus::Released.as_str(),
                super::models::JobState::Completed.as_str(),
                super::models::JobState::Failed.as_str(),
                super::models::JobState::Cancelled.as_str(),
            ],
            ResourceAllocation::from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_repository;
    use crate::db::models::NewJob;
    use crate::db::open_memory_pool_for_tests;
    use std::collections::HashMap;

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

    #[test]
    fn reserved_cpus_are_not_counted_in_the_cache_sum() {
        let pool = open_memory_pool_for_tests();
        let conn = pool.get().unwrap();
        let job_id = job_repository::insert(&conn, &sample_job()).unwrap();
        reserve(&conn, job_id, 2, "node0").unwrap();
        assert_eq!(sum_allocated_cpus(&conn).unwrap(), 0);
    }

    #[test]
    fn promote_then_sum_counts_allocated_cpus() {
        let pool = open_memory_pool_for_tests();
        let conn = pool.get().unwrap();
        let job_id = job_repository::insert(&conn, &sample_job()).unwrap();
        reserve(&conn, job_id, 2, "node0").unwrap();
        let prior = promote_to_allocated(&conn, job_id).unwrap();
        assert_eq!(prior, AllocationStatus::Reserved);
        assert_eq!(sum_allocated_cpus(&conn).unwrap(), 2);
    }

    #[test]
    fn release_reports_prior_status_for_cache_decisions() {
        let pool = open_memory_pool_for_tests();
        let conn = pool.get().unwrap();
        let job_id = job_repository::insert(&conn, &sample_job()).unwrap();
        reserve(&conn, job_id, 2, "node0").unwrap();
        promote_to_allocated(&conn, job_id).unwrap();
        let (prior, cpus) = release(&conn, job_id).unwrap().unwrap();
        assert_eq!(prior, AllocationStatus::Allocated);
        assert_eq!(cpus, 2);
        assert_eq!(sum_allocated_cpus(&conn).unwrap(), 0);
    }

    #[test]
    fn releasing_a_reserved_allocation_reports_reserved_not_allocated() {
        let pool = open_memory_pool_for_tests();
        let conn = pool.get().unwrap();
        let job_id = job_repository::insert(&conn, &sample_job()).unwrap();
        reserve(&conn, job_id, 2, "node0").unwrap();
        let (prior, _) = release(&conn, job_id).unwrap().unwrap();
        assert_eq!(prior, AllocationStatus::Reserved);
    }
}
