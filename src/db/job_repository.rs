// src/db/job_repository.rs
//
// Job row access. Every query here backs one scheduling operation: FIFO
// scanning for the scheduler, state transitions for the executor, and the
// lookups the API front-end needs for query/cancel.

use super::models::{exit_code, Job, JobState, NewJob};
use crate::error::{ConductorError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

pub fn insert(conn: &Connection, job: &NewJob) -> Result<i64> {
    let now = Utc::now();
    let env_json = serde_json::to_string(&job.environment)?;
    conn.execute(
        "INSERT INTO jobs (
            account, name, partition, script, working_directory,
            stdout_path, stderr_path, environment, tasks_per_node, cpus_per_task,
            memory_per_node, time_limit_minutes, exclusive, state, data_source,
            submit_time, eligible_time
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
        params![
            job.account,
            job.name,
            job.partition,
            job.script,
            job.working_directory,
            job.stdout_path,
            job.stderr_path,
            env_json,
            job.tasks_per_node,
            job.cpus_per_task,
            job.memory_per_node,
            job.time_limit_minutes,
            job.exclusive,
            JobState::Pending.as_str(),
            job.data_source,
            now,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: i64) -> Result<Job> {
    conn.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], Job::from_row)
        .optional()?
        .ok_or(ConductorError::JobNotFound(id))
}

/// PENDING jobs ordered by submit_time ascending, ties broken by id
/// ascending — the FIFO order the scheduler dispatches in.
pub fn list_pending_fifo(conn: &Connection) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM jobs WHERE state = ?1 ORDER BY submit_time ASC, id ASC",
    )?;
    let rows = stmt
        .query_map(params![JobState::Pending.as_str()], Job::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_by_state(conn: &Connection, state: JobState) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare("SELECT * FROM jobs WHERE state = ?1")?;
    let rows = stmt
        .query_map(params![state.as_str()], Job::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn mark_running(conn: &Connection, id: i64, node_name: &str) -> Result<()> {
    let now = Utc::now();
    conn.execute(
        "UPDATE jobs SET state = ?1, start_time = ?2, node_list = ?3 WHERE id = ?4",
        params![JobState::Running.as_str(), now, node_name, id],
    )?;
    Ok(())
}

/// Final state write for a job: sets state, end_time, exit_code, and
/// optionally error_msg in a single statement. Used by both the executor's
/// RECORD step and the cleanup strategies' terminal writes.
pub fn mark_terminal(
    conn: &Connection,
    id: i64,
    state: JobState,
    exit_code: &str,
    error_msg: Option<&str>,
) -> Result<()> {
    debug_assert!(state.is_terminal());
    let now = Utc::now();
    conn.execute(
        "UPDATE jobs SET state = ?1, end_time = ?2, exit_code = ?3, error_msg = ?4 WHERE id = ?5",
        params![state.as_str(), now, exit_code, error_msg, id],
    )?;
    Ok(())
}

/// Cancel is idempotent: cancelling a terminal job is a
/// no-op, not an error surfaced to the caller as a failure.
pub fn cancel(conn: &Connection, id: i64) -> Result<Job> {
    let job = get(conn, id)?;
    if job.state.is_terminal() {
        return Err(ConductorError::IllegalState(format!(
            "job {id} already terminal"
        )));
    }
    mark_terminal(conn, id, JobState::Cancelled, exit_code::CANCELLED, None)?;
    get(conn, id)
}

pub fn delete(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_pool_for_tests;
    use std::collections::HashMap;

    fn sample_job() -> NewJob {
        NewJob {
            account: "alice".into(),
            name: "test".into(),
            partition: "default".into(),
            script: "exit 0".into(),
            working_directory: "/tmp".into(),
            stdout_path: "stdout.log".into(),
            stderr_path: "stderr.log".into(),
            environment: HashMap::new(),
            tasks_per_node: 1,
            cpus_per_task: 2,
            memory_per_node: "1G".into(),
            time_limit_minutes: Some(10),
            exclusive: false,
            data_source: "api".into(),
        }
    }

    #[test]
    fn insert_and_get_round_trips() {
        let pool = open_memory_pool_for_tests();
        let conn = pool.get().unwrap();
        let id = insert(&conn, &sample_job()).unwrap();
        let job = get(&conn, id).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.total_cpus(), 2);
    }

    #[test]
    fn fifo_order_is_submit_time_then_id() {
        let pool = open_memory_pool_for_tests();
        let conn = pool.get().unwrap();
        let a = insert(&conn, &sample_job()).unwrap();
        let b = insert(&conn, &sample_job()).unwrap();
        let jobs = list_pending_fifo(&conn).unwrap();
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let pool = open_memory_pool_for_tests();
        let conn = pool.get().unwrap();
        let id = insert(&conn, &sample_job()).unwrap();
        cancel(&conn, id).unwrap();
        let err = cancel(&conn, id).unwrap_err();
        assert!(err.is_idempotent_cancel());
    }

    #[test]
    fn get_unknown_job_is_not_found() {
        let pool = open_memory_pool_for_tests();
        let conn = pool.get().unwrap();
        let err = get(&conn, 999).unwrap_err();
        assert!(matches!(err, ConductorError::JobNotFound(999)));
    }
}
