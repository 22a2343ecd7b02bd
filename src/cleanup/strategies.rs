// src/cleanup/strategies.rs
//
// The four default periodic strategies. Each owns one trigger/repair pair;
// the manager in `mod.rs` owns scheduling.

use super::{CleanupStrategy, ResourceAccountingHandle};
use crate::db::allocation_repository;
use crate::db::job_repository;
use crate::db::models::{exit_code, AllocationStatus, JobState};
use crate::error::Result;
use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::Connection;
use std::time::Duration;

/// Priority 1: releases allocations whose job already reached a terminal
/// state but whose allocation row was never released (the normal RELEASE
/// step failing, or a crash between RECORD and RELEASE).
pub struct CompletedJobCleanup;

impl CleanupStrategy for CompletedJobCleanup {
    fn name(&self) -> &'static str {
        "completed_job_cleanup"
    }

    fn description(&self) -> &'static str {
        "releases allocations left behind by jobs that already reached a terminal state"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn priority(&self) -> u8 {
        1
    }

    fn do_cleanup(&self, conn: &Connection, accounting: &ResourceAccountingHandle) -> Result<usize> {
        let rows = allocation_repository::list_unreleased_for_terminal_jobs(conn)?;
        let mut repaired = 0;
        for alloc in rows {
            if let Some((prior, cpus)) = allocation_repository::release(conn, alloc.job_id)? {
                if prior == AllocationStatus::Allocated {
                    accounting.queue_release(cpus);
                }
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}

/// Priority 2, runs after `CompletedJobCleanup`: a reservation that never
/// got promoted within the grace window means the dispatch token was lost
/// or the worker never started — fail the job rather than leave it RUNNING
/// forever with no allocated process.
pub struct StaleReservationCleanup {
    pub max_age_minutes: i64,
}

impl CleanupStrategy for StaleReservationCleanup {
    fn name(&self) -> &'static str {
        "stale_reservation_cleanup"
    }

    fn description(&self) -> &'static str {
        "fails jobs whose reservation was never promoted to an allocation"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(120)
    }

    fn priority(&self) -> u8 {
        2
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["completed_job_cleanup"]
    }

    fn do_cleanup(&self, conn: &Connection, _accounting: &ResourceAccountingHandle) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::minutes(self.max_age_minutes);
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
            // Still RESERVED, never counted in the cache: no cache delta.
            allocation_repository::release(conn, job_id)?;
            repaired += 1;
        }
        Ok(repaired)
    }
}

/// Priority 3, runs after `CompletedJobCleanup`: a job that has been RUNNING
/// far longer than any real job should have either hung or its worker died
/// without the periodic/recovery paths noticing.
pub struct StuckJobCleanup {
    pub max_age_hours: i64,
}

impl CleanupStrategy for StuckJobCleanup {
    fn name(&self) -> &'static str {
        "stuck_job_cleanup"
    }

    fn description(&self) -> &'static str {
        "fails jobs that have been RUNNING far longer than any real workload should take"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(3600)
    }

    fn priority(&self) -> u8 {
        3
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["completed_job_cleanup"]
    }

    fn do_cleanup(&self, conn: &Connection, accounting: &ResourceAccountingHandle) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::hours(self.max_age_hours);
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
                exit_code::STUCK_JOB,
                Some("job exceeded the maximum allowed runtime"),
            )?;
            if let Some((prior, cpus)) = allocation_repository::release(conn, job.id)? {
                if prior == AllocationStatus::Allocated {
                    accounting.queue_release(cpus);
                }
            }
            repaired += 1;
        }
        Ok(repaired)
    }
}

/// Priority 4, disabled by default: hard-deletes terminal jobs past a
/// retention window. Cascades to the allocation row via the foreign key.
pub struct OldJobCleanup {
    pub enabled: bool,
    pub max_age_days: i64,
}

impl CleanupStrategy for OldJobCleanup {
    fn name(&self) -> &'static str {
        "old_job_cleanup"
    }

    fn description(&self) -> &'static str {
        "hard-deletes terminal jobs past the retention window"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(86_400)
    }

    fn priority(&self) -> u8 {
        4
    }

    fn enabled_by_default(&self) -> bool {
        self.enabled
    }

    fn do_cleanup(&self, conn: &Connection, _accounting: &ResourceAccountingHandle) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(self.max_age_days);
        let mut repaired = 0;
        for state in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
            for job in job_repository::list_by_state(conn, state)? {
                if job.end_time.map(|t| t < cutoff).unwrap_or(false) {
                    job_repository::delete(conn, job.id)?;
                    repaired += 1;
                }
            }
        }
        Ok(repaired)
    }
}
