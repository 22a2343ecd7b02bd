// src/db/mod.rs
//
// =============================================================================
// CONDUCTOR: SQL SYSTEM OF RECORD (v 0.1)
// =============================================================================
//
// Durable storage for jobs, allocations, and the (rarely used) static
// system_resources fallback table, pooled via r2d2. Schema: tables `jobs`,
// `resource_allocations`, `system_resources`, each with the indexes their
// hot-path queries need (FIFO pending lookup, allocation status sums,
// stale-reservation scans).

pub mod allocation_repository;
pub mod job_repository;
pub mod models;

use crate::error::{ConductorError, Result};
use r2d2_sqlite::SqliteConnectionManager;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;
pub type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

pub fn open_pool(database_url: &str) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(database_url).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=10000;
             PRAGMA foreign_keys=ON;",
        )
    });
    let pool = r2d2::Pool::builder()
        .max_size(8)
        .build(manager)
        .map_err(ConductorError::Pool)?;
    init_schema(&pool.get().map_err(ConductorError::Pool)?)?;
    Ok(pool)
}

fn init_schema(conn: &rusqlite::Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;

        CREATE TABLE IF NOT EXISTS jobs (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            account             TEXT NOT NULL,
            name                TEXT NOT NULL,
            partition           TEXT NOT NULL,
            script              TEXT NOT NULL,
            working_directory   TEXT NOT NULL,
            stdout_path         TEXT NOT NULL,
            stderr_path         TEXT NOT NULL,
            environment         TEXT NOT NULL DEFAULT '{}',
            tasks_per_node      INTEGER NOT NULL,
            cpus_per_task       INTEGER NOT NULL,
            memory_per_node     TEXT NOT NULL,
            time_limit_minutes  INTEGER,
            exclusive           INTEGER NOT NULL DEFAULT 0,
            state               TEXT NOT NULL,
            data_source         TEXT NOT NULL DEFAULT 'api',
            submit_time         TEXT NOT NULL,
            eligible_time       TEXT NOT NULL,
            start_time          TEXT,
            end_time            TEXT,
            exit_code           TEXT,
            error_msg           TEXT,
            node_list           TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
        CREATE INDEX IF NOT EXISTS idx_jobs_submit_time ON jobs(submit_time);
        CREATE INDEX IF NOT EXISTS idx_jobs_partition ON jobs(partition);
        CREATE INDEX IF NOT EXISTS idx_jobs_account ON jobs(account);

        CREATE TABLE IF NOT EXISTS resource_allocations (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id              INTEGER NOT NULL UNIQUE REFERENCES jobs(id) ON DELETE CASCADE,
            allocated_cpus      INTEGER NOT NULL,
            node_name           TEXT NOT NULL,
            process_id          INTEGER,
            allocation_time     TEXT NOT NULL,
            released_time       TEXT,
            status              TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_allocations_status ON resource_allocations(status);
        CREATE INDEX IF NOT EXISTS idx_allocations_node_name ON resource_allocations(node_name);

        CREATE TABLE IF NOT EXISTS system_resources (
            node_name   TEXT PRIMARY KEY,
            total_cpus  INTEGER NOT NULL,
            partition   TEXT NOT NULL,
            available   INTEGER NOT NULL DEFAULT 1
        );

        COMMIT;",
    )?;
    Ok(())
}

#[cfg(test)]
pub fn open_memory_pool_for_tests() -> DbPool {
    let manager = SqliteConnectionManager::memory();
    let pool = r2d2::Pool::builder()
        .max_size(1)
        .build(manager)
        .expect("in-memory pool");
    init_schema(&pool.get().expect("conn")).expect("schema");
    pool
}
