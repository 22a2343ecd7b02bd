// src/db/models.rs
//
// =============================================================================
// CONDUCTOR: DATA MODEL (v 0.1)
// =============================================================================
//
// Durable entities. Jobs and ResourceAllocations are the two tables the
// scheduler/executor/cleanup engine all share; both are stored as typed
// columns (not JSON blobs) since every field participates in a query
// predicate somewhere.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobState::Pending),
            "RUNNING" => Some(JobState::Running),
            "COMPLETED" => Some(JobState::Completed),
            "FAILED" => Some(JobState::Failed),
            "CANCELLED" => Some(JobState::Cancelled),
            _ => None,
        }
    }
}

impl ToSql for JobState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        JobState::from_str(s).ok_or(FromSqlError::InvalidType)
    }
}

/// Tri-state allocation lifecycle. No separate boolean `released` column is
/// carried alongside this (see DESIGN.md, Open Question 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AllocationStatus {
    Reserved,
    Allocated,
    Released,
}

impl AllocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationStatus::Reserved => "RESERVED",
            AllocationStatus::Allocated => "ALLOCATED",
            AllocationStatus::Released => "RELEASED",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "RESERVED" => Some(AllocationStatus::Reserved),
            "ALLOCATED" => Some(AllocationStatus::Allocated),
            "RELEASED" => Some(AllocationStatus::Released),
            _ => None,
        }
    }
}

impl ToSql for AllocationStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AllocationStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        AllocationStatus::from_str(s).ok_or(FromSqlError::InvalidType)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub account: String,
    pub name: String,
    pub partition: String,
    pub script: String,
    pub working_directory: String,
    pub stdout_path: String,
    pub stderr_path: String,
    pub environment: HashMap<String, String>,
    pub tasks_per_node: i64,
    pub cpus_per_task: i64,
    pub memory_per_node: String,
    pub time_limit_minutes: Option<i64>,
    pub exclusive: bool,
    pub state: JobState,
    pub data_source: String,
    pub submit_time: DateTime<Utc>,
    pub eligible_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<String>,
    pub error_msg: Option<String>,
    pub node_list: Option<String>,
}

impl Job {
    pub fn total_cpus(&self) -> i64 {
        self.tasks_per_node * self.cpus_per_task
    }

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let env_json: String = row.get("environment")?;
        let environment = serde_json::from_str(&env_json).unwrap_or_default();
        Ok(Job {
            id: row.get("id")?,
            account: row.get("account")?,
            name: row.get("name")?,
            partition: row.get("partition")?,
            script: row.get("script")?,
            working_directory: row.get("working_directory")?,
            stdout_path: row.get("stdout_path")?,
            stderr_path: row.get("stderr_path")?,
            environment,
            tasks_per_node: row.get("tasks_per_node")?,
            cpus_per_task: row.get("cpus_per_task")?,
            memory_per_node: row.get("memory_per_node")?,
            time_limit_minutes: row.get("time_limit_minutes")?,
            exclusive: row.get("exclusive")?,
            state: row.get("state")?,
            data_source: row.get("data_source")?,
            submit_time: row.get("submit_time")?,
            eligible_time: row.get("eligible_time")?,
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
            exit_code: row.get("exit_code")?,
            error_msg: row.get("error_msg")?,
            node_list: row.get("node_list")?,
        })
    }
}

/// Fields required to submit a new job; everything else is assigned by the
/// scheduler/executor as the job progresses.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub account: String,
    pub name: String,
    pub partition: String,
    pub script: String,
    pub working_directory: String,
    pub stdout_path: String,
    pub stderr_path: String,
    pub environment: HashMap<String, String>,
    pub tasks_per_node: i64,
    pub cpus_per_task: i64,
    pub memory_per_node: String,
    pub time_limit_minutes: Option<i64>,
    pub exclusive: bool,
    pub data_source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub id: i64,
    pub job_id: i64,
    pub allocated_cpus: i64,
    pub node_name: String,
    pub process_id: Option<i32>,
    pub allocation_time: DateTime<Utc>,
    pub released_time: Option<DateTime<Utc>>,
    pub status: AllocationStatus,
}

impl ResourceAllocation {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ResourceAllocation {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            allocated_cpus: row.get("allocated_cpus")?,
            node_name: row.get("node_name")?,
            process_id: row.get("process_id")?,
            allocation_time: row.get("allocation_time")?,
            released_time: row.get("released_time")?,
            status: row.get("status")?,
        })
    }
}

/// Exit-code string encoding: `"<process-exit-code>:<signal>"`, with
/// negative codes for synthetic system-level outcomes.
pub mod exit_code {
    pub fn normal(code: i32) -> String {
        format!("{code}:0")
    }
    pub const CANCELLED: &str = "-1:15";
    pub const WAITLOOP_FAILURE: &str = "-1:0";
    pub const STUCK_JOB: &str = "-2:0";
    pub const STALE_RESERVATION: &str = "-3:0";
    pub const TIMEOUT_RECOVERY: &str = "-998:0";
    pub const ORPHAN_RECOVERY: &str = "-999:0";
}
