// src/executor/mod.rs
//
// =============================================================================
// CONDUCTOR: EXECUTOR WORKER (v 0.1)
// =============================================================================
//
// `execute(job_id)` is the queue consumer's only entry point, carrying a
// job through LOAD -> PROMOTE -> PREPARE -> SPAWN -> WAIT -> RECORD ->
// RELEASE. RELEASE always runs no matter how the fallible middle turned
// out: a match on the fallible steps, followed by an unconditional
// teardown step — the async stand-in for a scoped-acquisition guard, since
// Rust has no stable async `Drop`.

pub mod process;

use crate::db::models::{exit_code, AllocationStatus, JobState};
use crate::db::{allocation_repository, job_repository, DbPool};
use crate::error::{ConductorError, Result};
use crate::resources::ResourceAccounting;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

pub struct Executor {
    db: DbPool,
    accounting: Arc<ResourceAccounting>,
    node_name: String,
    job_work_base_dir: PathBuf,
    script_dir: PathBuf,
}

impl Executor {
    pub fn new(
        db: DbPool,
        accounting: Arc<ResourceAccounting>,
        node_name: String,
        job_work_base_dir: PathBuf,
        script_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            accounting,
            node_name,
            job_work_base_dir,
            script_dir,
        }
    }

    /// Runs one dispatch token end to end.
    pub async fn execute(&self, job_id: i64) -> Result<()> {
        // --- LOAD -----------------------------------------------------
        let job = {
            let conn = self.db.get()?;
            job_repository::get(&conn, job_id)?
        };

        if job.state != JobState::Running {
            // Idempotency: a duplicate token, or a job cancelled while it
            // was still only RESERVED. Either way there is nothing to run;
            // release any dangling RESERVED allocation so its (never
            // counted) reservation doesn't linger until the periodic
            // cleanup strategy catches up.
            log::info!("job {job_id} is not RUNNING (state={:?}), skipping dispatch", job.state);
            let conn = self.db.get()?;
            allocation_repository::release(&conn, job_id)?;
            return Ok(());
        }

        // --- PROMOTE ----------------------------------------------------
        let allocated_cpus = {
            let conn = self.db.get()?;
            let prior = match allocation_repository::get_by_job(&conn, job_id)? {
                Some(alloc) => {
                    allocation_repository::promote_to_allocated(&conn, job_id)?;
                    alloc.allocated_cpus
                }
                None => {
                    // Defensive path: should not happen on the happy path.
                    let cpus = job.total_cpus();
                    allocation_repository::create_allocated(&conn, job_id, cpus, &self.node_name)?;
                    cpus
                }
            };
            self.accounting.allocate(prior).await?;
            prior
        };

        // --- PREPARE / SPAWN / WAIT, with guaranteed RELEASE -----------
        let outcome = self.run_job(&job).await;

        // --- RELEASE (always runs, matching guardian.rs's teardown step) --
        let conn = self.db.get()?;
        if let Some((prior, _)) = allocation_repository::release(&conn, job_id)? {
            if prior == AllocationStatus::Allocated {
                self.accounting.release(allocated_cpus).await?;
            }
        }
        drop(conn);

        outcome
    }

    /// PREPARE -> SPAWN -> WAIT -> RECORD. Any error here still lets
    /// `execute` run RELEASE before propagating.
    async fn run_job(&self, job: &crate::db::models::Job) -> Result<()> {
        let job_dir = PathBuf::from(&job.working_directory);
        let work_dir = if job_dir.is_absolute() {
            job_dir
        } else {
            self.job_work_base_dir.join(job_dir)
        };
        tokio::fs::create_dir_all(&work_dir).await?;

        let script_path = self.script_dir.join(format!("job_{}.sh", job.id));
        tokio::fs::write(&script_path, &job.script).await?;
        set_executable(&script_path).await?;

        let stdout_path = work_dir.join(&job.stdout_path);
        let stderr_path = work_dir.join(&job.stderr_path);
        let stdout = open_append(&stdout_path).await?;
        let stderr = open_append(&stderr_path).await?;

        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(job.environment.clone());

        let mut child = process::spawn_job(&script_path, &work_dir, &env, stdout, stderr)
            .await
            .map_err(|e| ConductorError::Infrastructure(format!("failed to spawn job: {e}")))?;

        if let Some(pid) = child.id() {
            let conn = self.db.get()?;
            allocation_repository::set_process_id(&conn, job.id, pid as i32)?;
        }

        let time_limit = job
            .time_limit_minutes
            .map(|m| Duration::from_secs((m.max(0) as u64) * 60));

        let outcome = process::wait_with_timeout(&mut child, time_limit).await;

        let (state, code, error_msg) = match outcome {
            process::ExitOutcome::Exited(0) => (JobState::Completed, exit_code::normal(0), None),
            process::ExitOutcome::Exited(code) => (
                JobState::Failed,
                exit_code::normal(code),
                Some(format!("script exited with code {code}")),
            ),
            process::ExitOutcome::Signaled(15) => (
                JobState::Cancelled,
                exit_code::CANCELLED.to_string(),
                None,
            ),
            process::ExitOutcome::Signaled(sig) => (
                JobState::Failed,
                format!("-1:{sig}"),
                Some(format!("script terminated by signal {sig}")),
            ),
            process::ExitOutcome::TimedOut => (
                JobState::Failed,
                exit_code::WAITLOOP_FAILURE.to_string(),
                Some(format!(
                    "job exceeded its time limit ({} min)",
                    job.time_limit_minutes.unwrap_or(0)
                )),
            ),
        };

        let conn = self.db.get()?;
        job_repository::mark_terminal(&conn, job.id, state, &code, error_msg.as_deref())?;
        Ok(())
    }
}

async fn open_append(path: &std::path::Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

#[cfg(unix)]
async fn set_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewJob;
    use crate::db::{job_repository, open_memory_pool_for_tests};
    use crate::kv::InMemoryKv;
    use crate::registry::WorkerRegistry;
    use tempfile::tempdir;

    fn new_job(script: &str, work_dir: &std::path::Path) -> NewJob {
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
            cpus_per_task: 1,
            memory_per_node: "256M".into(),
            time_limit_minutes: Some(1),
            exclusive: false,
            data_source: "api".into(),
        }
    }

    async fn new_executor(db: DbPool, script_dir: PathBuf, work_base: PathBuf) -> Executor {
        let kv: Arc<dyn crate::kv::Kv> = Arc::new(InMemoryKv::new());
        let registry = Arc::new(WorkerRegistry::new(kv.clone(), Duration::from_secs(30)));
        registry.register("w0", 4, "host0").await.unwrap();
        let accounting = Arc::new(ResourceAccounting::new(kv, registry, 4));
        Executor::new(db, accounting, "node0".into(), work_base, script_dir)
    }

    #[tokio::test]
    async fn happy_path_completes_with_zero_exit() {
        let dir = tempdir().unwrap();
        let db = open_memory_pool_for_tests();
        let executor = new_executor(db.clone(), dir.path().to_path_buf(), dir.path().to_path_buf()).await;

        let conn = db.get().unwrap();
        let job_id = job_repository::insert(&conn, &new_job("exit 0", dir.path())).unwrap();
        job_repository::mark_running(&conn, job_id, "node0").unwrap();
        allocation_repository::reserve(&conn, job_id, 1, "node0").unwrap();
        drop(conn);

        executor.execute(job_id).await.unwrap();

        let conn = db.get().unwrap();
        let job = job_repository::get(&conn, job_id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.exit_code.as_deref(), Some("0:0"));
        let alloc = allocation_repository::get_by_job(&conn, job_id).unwrap().unwrap();
        assert_eq!(alloc.status, AllocationStatus::Released);
    }

    #[tokio::test]
    async fn non_running_job_is_skipped_idempotently() {
        let dir = tempdir().unwrap();
        let db = open_memory_pool_for_tests();
        let executor = new_executor(db.clone(), dir.path().to_path_buf(), dir.path().to_path_buf()).await;

        let conn = db.get().unwrap();
        let job_id = job_repository::insert(&conn, &new_job("exit 0", dir.path())).unwrap();
        // still PENDING: never promoted to RUNNING by a scheduler tick.
        drop(conn);

        executor.execute(job_id).await.unwrap();

        let conn = db.get().unwrap();
        let job = job_repository::get(&conn, job_id).unwrap();
        assert_eq!(job.state, JobState::Pending);
    }
}
