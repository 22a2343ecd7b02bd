// src/config.rs
//
// =============================================================================
// CONDUCTOR: CONFIGURATION (v 0.1)
// =============================================================================
//
// Layered config: an optional `conductor.toml` file, overridden by environment
// variables prefixed `CONDUCTOR_` (nested keys use `__`, e.g.
// `CONDUCTOR_API_PORT`). Environment always wins. `.env` files are loaded
// once at process start via `dotenvy` as a development convenience.

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub kv_url: String,
    pub queue_name: String,
    pub result_ttl: u64,
    pub api_host: String,
    pub api_port: u16,
    pub node_name: String,
    pub total_cpus: u32,
    pub default_partition: String,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub job_work_base_dir: PathBuf,
    pub script_dir: PathBuf,
    pub check_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub stale_reservation_minutes: i64,
    pub stuck_job_hours: i64,
    pub old_job_days: i64,
    pub old_job_cleanup_enabled: bool,
    pub worker_timeout_recovery_hours: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "conductor.sqlite3".to_string(),
            kv_url: "redis://127.0.0.1:6379".to_string(),
            queue_name: "conductor:jobs".to_string(),
            result_ttl: 86_400,
            api_host: "0.0.0.0".to_string(),
            api_port: 8080,
            node_name: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string()),
            total_cpus: num_cpus::get() as u32,
            default_partition: "default".to_string(),
            log_level: "info".to_string(),
            log_file: None,
            job_work_base_dir: PathBuf::from("/var/lib/conductor/work"),
            script_dir: PathBuf::from("/var/lib/conductor/scripts"),
            check_interval_secs: 5,
            heartbeat_interval_secs: 30,
            stale_reservation_minutes: 10,
            stuck_job_hours: 48,
            old_job_days: 30,
            old_job_cleanup_enabled: false,
            worker_timeout_recovery_hours: 48,
        }
    }
}

impl Config {
    /// Loads configuration from `conductor.toml` (if present) layered under
    /// `CONDUCTOR_*` environment variables, which always take precedence.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(
                config::File::with_name("conductor").required(false),
            )
            .add_source(
                config::Environment::with_prefix("CONDUCTOR")
                    .separator("__")
                    .try_parsing(true),
            );

        // Layer defaults first so partially-specified files/env still produce
        // a complete struct.
        let defaults = Config::default();
        let builder = builder
            .set_default("database_url", defaults.database_url)?
            .set_default("kv_url", defaults.kv_url)?
            .set_default("queue_name", defaults.queue_name)?
            .set_default("result_ttl", defaults.result_ttl)?
            .set_default("api_host", defaults.api_host)?
            .set_default("api_port", defaults.api_port as i64)?
            .set_default("node_name", defaults.node_name)?
            .set_default("total_cpus", defaults.total_cpus as i64)?
            .set_default("default_partition", defaults.default_partition)?
            .set_default("log_level", defaults.log_level)?
            .set_default("job_work_base_dir", defaults.job_work_base_dir.to_string_lossy().into_owned())?
            .set_default("script_dir", defaults.script_dir.to_string_lossy().into_owned())?
            .set_default("check_interval_secs", defaults.check_interval_secs as i64)?
            .set_default("heartbeat_interval_secs", defaults.heartbeat_interval_secs as i64)?
            .set_default("stale_reservation_minutes", defaults.stale_reservation_minutes)?
            .set_default("stuck_job_hours", defaults.stuck_job_hours)?
            .set_default("old_job_days", defaults.old_job_days)?
            .set_default("old_job_cleanup_enabled", defaults.old_job_cleanup_enabled)?
            .set_default("worker_timeout_recovery_hours", defaults.worker_timeout_recovery_hours)?;

        let raw = builder.build()?;
        let cfg: Config = raw.try_deserialize()?;
        Ok(cfg)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_interval_secs * 2)
    }

    pub fn check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.check_interval_secs)
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.job_work_base_dir)?;
        std::fs::create_dir_all(&self.script_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = Config::default();
        assert!(cfg.total_cpus >= 1);
        assert_eq!(cfg.heartbeat_ttl(), cfg.heartbeat_interval() * 2);
    }
}
