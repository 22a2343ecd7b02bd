// src/api/handlers.rs
//
// Three endpoints, thin glue over the library's repositories — the API
// front-end owns no business logic beyond request validation and response
// shaping.

use super::log_reader;
use super::schemas::{
    validate_job_spec, CancelResponse, JobLog, QueryResponse, SubmitRequest, SubmitResponse,
};
use crate::api::AppState;
use crate::db::models::NewJob;
use crate::db::{allocation_repository, job_repository};
use crate::error::Result;
use axum::extract::{Path, State};
use axum::Json;
use std::path::PathBuf;
use std::sync::Arc;

pub async fn submit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>> {
    validate_job_spec(&req.job)?;

    let new_job = NewJob {
        account: req.job.account,
        name: req.job.name,
        partition: req
            .job
            .partition
            .unwrap_or_else(|| state.config.default_partition.clone()),
        script: req.script,
        working_directory: req.job.current_working_directory,
        stdout_path: req.job.standard_output,
        stderr_path: req.job.standard_error,
        environment: req.job.environment,
        tasks_per_node: req.job.ntasks_per_node,
        cpus_per_task: req.job.cpus_per_task,
        memory_per_node: req.job.memory_per_node,
        time_limit_minutes: req
            .job
            .time_limit
            .as_deref()
            .map(super::schemas::parse_time_limit)
            .transpose()?,
        exclusive: req.job.exclusive,
        data_source: "api".to_string(),
    };

    let conn = state.db.get()?;
    let job_id = job_repository::insert(&conn, &new_job)?;

    Ok(Json(SubmitResponse {
        job_id: job_id.to_string(),
    }))
}

pub async fn query(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<QueryResponse>> {
    let conn = state.db.get()?;
    let job = job_repository::get(&conn, id)?;
    let allocation = allocation_repository::get_by_job(&conn, id)?;
    drop(conn);

    let work_dir = PathBuf::from(&job.working_directory);
    let stdout = log_reader::tail(&work_dir.join(&job.stdout_path)).await;
    let stderr = log_reader::tail(&work_dir.join(&job.stderr_path)).await;

    Ok(Json(QueryResponse::build(
        &job,
        allocation.as_ref(),
        JobLog { stdout, stderr },
    )))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<CancelResponse>> {
    let conn = state.db.get()?;
    match job_repository::cancel(&conn, id) {
        Ok(_) => {}
        Err(e) if e.is_idempotent_cancel() => {
            return Ok(Json(CancelResponse { msg: "取消成功" }));
        }
        Err(e) => return Err(e),
    }

    // Cooperative cancellation at the OS boundary: if a process has
    // already been spawned, signal its process group.
    if let Some(alloc) = allocation_repository::get_by_job(&conn, id)? {
        if let Some(pid) = alloc.process_id {
            crate::executor::process::send_sigterm_to_group(pid);
        }
    }

    Ok(Json(CancelResponse { msg: "取消成功" }))
}
