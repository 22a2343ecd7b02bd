// src/api/schemas.rs
//
// Request/response DTOs plus the validation-boundary parsing the submit
// path needs: `time_limit` accepts bare minutes or `H:M`/`H:M:S`/`D-H:M:S`;
// `memory_per_node` accepts a `G`/`M` suffix. These run once, at the API
// boundary, before a job ever becomes a `NewJob`.

use crate::db::models::{Job, ResourceAllocation};
use crate::error::ConductorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub job: JobSpec,
    pub script: String,
}

#[derive(Debug, Deserialize)]
pub struct JobSpec {
    pub account: String,
    pub name: String,
    #[serde(default)]
    pub partition: Option<String>,
    pub current_working_directory: String,
    pub standard_output: String,
    pub standard_error: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub ntasks_per_node: i64,
    pub cpus_per_task: i64,
    pub memory_per_node: String,
    #[serde(default)]
    pub time_limit: Option<String>,
    #[serde(default)]
    pub exclusive: bool,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub msg: &'static str,
}

#[derive(Debug, Serialize)]
pub struct JobLog {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Serialize)]
pub struct JobDetail {
    pub name: String,
    pub user: String,
    pub partition: String,
    pub allocated_cpus: Option<i64>,
    pub node_list: Option<String>,
    pub exit_code: Option<String>,
    pub working_directory: String,
    pub data_source: String,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub job_id: String,
    pub state: String,
    pub submit_time: DateTime<Utc>,
    pub eligible_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed_time: String,
    pub limit_time: String,
    pub job_log: JobLog,
    pub detail: JobDetail,
}

impl QueryResponse {
    pub fn build(job: &Job, allocation: Option<&ResourceAllocation>, job_log: JobLog) -> Self {
        let elapsed = match (job.start_time, job.end_time) {
            (Some(start), Some(end)) => (end - start).num_seconds(),
            (Some(start), None) => (Utc::now() - start).num_seconds(),
            _ => 0,
        };
        QueryResponse {
            job_id: job.id.to_string(),
            state: job.state.as_str().to_string(),
            submit_time: job.submit_time,
            eligible_time: job.eligible_time,
            start_time: job.start_time,
            end_time: job.end_time,
            elapsed_time: format_elapsed(elapsed.max(0) as u64),
            limit_time: format_limit(job.time_limit_minutes),
            job_log,
            detail: JobDetail {
                name: job.name.clone(),
                user: job.account.clone(),
                partition: job.partition.clone(),
                allocated_cpus: allocation.map(|a| a.allocated_cpus),
                node_list: job.node_list.clone(),
                exit_code: job.exit_code.clone(),
                working_directory: job.working_directory.clone(),
                data_source: job.data_source.clone(),
            },
        }
    }
}

/// Formats an elapsed duration as `D-HH:MM:SS`, day field always present.
pub fn format_elapsed(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    format!("{days}-{hours:02}:{minutes:02}:{secs:02}")
}

/// Formats a time limit as `H:MM:SS` (unpadded hours, no day field),
/// `D-HH:MM:SS`, or `"UNLIMITED"`.
pub fn format_limit(minutes: Option<i64>) -> String {
    match minutes {
        None => "UNLIMITED".to_string(),
        Some(m) => {
            let total_secs = (m.max(0) as u64) * 60;
            let days = total_secs / 86_400;
            let hours = (total_secs % 86_400) / 3600;
            let mins = (total_secs % 3600) / 60;
            let secs = total_secs % 60;
            if days > 0 {
                format!("{days}-{hours:02}:{mins:02}:{secs:02}")
            } else {
                format!("{hours}:{mins:02}:{secs:02}")
            }
        }
    }
}

/// Accepts digits-only minutes, `"H:M"`, `"H:M:S"`, or `"D-H:M:S"`.
pub fn parse_time_limit(raw: &str) -> Result<i64, ConductorError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConductorError::Validation("time_limit must not be empty".into()));
    }

    if let Ok(minutes) = raw.parse::<i64>() {
        return Ok(minutes);
    }

    let (days, rest) = match raw.split_once('-') {
        Some((d, rest)) => (
            d.parse::<i64>()
                .map_err(|_| ConductorError::Validation(format!("invalid day component in time_limit: {raw}")))?,
            rest,
        ),
        None => (0, raw),
    };

    let parts: Vec<&str> = rest.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m] => (parse_component(h, raw)?, parse_component(m, raw)?, 0),
        [h, m, s] => (
            parse_component(h, raw)?,
            parse_component(m, raw)?,
            parse_component(s, raw)?,
        ),
        _ => {
            return Err(ConductorError::Validation(format!(
                "unrecognized time_limit format: {raw}"
            )))
        }
    };

    let _ = seconds; // sub-minute precision is not tracked; time limits are minute-granular
    Ok(days * 24 * 60 + hours * 60 + minutes)
}

fn parse_component(s: &str, raw: &str) -> Result<i64, ConductorError> {
    s.parse::<i64>()
        .map_err(|_| ConductorError::Validation(format!("unrecognized time_limit format: {raw}")))
}

/// Accepts `"16G"`/`"1024M"`-style suffixes, returning MB.
pub fn parse_memory_mb(raw: &str) -> Result<i64, ConductorError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConductorError::Validation("memory_per_node must not be empty".into()));
    }
    let upper = raw.to_uppercase();
    if let Some(digits) = upper.strip_suffix('G') {
        let gb: i64 = digits
            .parse()
            .map_err(|_| ConductorError::Validation(format!("invalid memory_per_node: {raw}")))?;
        return Ok(gb * 1024);
    }
    if let Some(digits) = upper.strip_suffix('M') {
        return digits
            .parse()
            .map_err(|_| ConductorError::Validation(format!("invalid memory_per_node: {raw}")));
    }
    upper
        .parse()
        .map_err(|_| ConductorError::Validation(format!("invalid memory_per_node: {raw}")))
}

pub fn validate_job_spec(spec: &JobSpec) -> Result<(), ConductorError> {
    if spec.ntasks_per_node <= 0 || spec.cpus_per_task <= 0 {
        return Err(ConductorError::Validation(
            "ntasks_per_node and cpus_per_task must be positive".into(),
        ));
    }
    parse_memory_mb(&spec.memory_per_node)?;
    if let Some(limit) = &spec.time_limit {
        parse_time_limit(limit)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_minutes() {
        assert_eq!(parse_time_limit("90").unwrap(), 90);
    }

    #[test]
    fn parses_hours_minutes() {
        assert_eq!(parse_time_limit("1:30").unwrap(), 90);
    }

    #[test]
    fn parses_days_hours_minutes_seconds() {
        assert_eq!(parse_time_limit("1-02:00:00").unwrap(), 24 * 60 + 120);
    }

    #[test]
    fn parses_memory_suffixes() {
        assert_eq!(parse_memory_mb("16G").unwrap(), 16384);
        assert_eq!(parse_memory_mb("1024M").unwrap(), 1024);
        assert_eq!(parse_memory_mb("512").unwrap(), 512);
    }

    #[test]
    fn format_limit_reports_unlimited_for_none() {
        assert_eq!(format_limit(None), "UNLIMITED");
    }

    #[test]
    fn format_elapsed_always_includes_day_prefix() {
        assert_eq!(format_elapsed(59), "0-00:00:59");
        assert_eq!(format_elapsed(90_000), "1-01:00:00");
    }

    #[test]
    fn format_limit_uses_unpadded_hours_without_day_prefix() {
        assert_eq!(format_limit(Some(120)), "2:00:00");
        assert_eq!(format_limit(Some(24 * 60 + 120)), "1-02:00:00");
    }

    #[test]
    fn rejects_garbage_time_limit() {
        assert!(parse_time_limit("not-a-duration").is_err());
    }
}
