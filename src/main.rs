// src/main.rs
//
// =============================================================================
// CONDUCTOR: COMMANDER & ENTRY POINT (v 0.1)
// =============================================================================
//
// The wiring center of the whole service. One binary, three long-running
// roles, each a `clap::Subcommand` arm booting a distinct loop against the
// shared library modules.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conductor::cleanup::{CleanupConfig, CleanupManager};
use conductor::db;
use conductor::executor::Executor;
use conductor::heartbeat::Heartbeat;
use conductor::kv::{Kv, RedisKv};
use conductor::queue::{Queue, RedisQueue};
use conductor::registry::WorkerRegistry;
use conductor::resources::ResourceAccounting;
use conductor::{Config, Scheduler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::time::{sleep, Duration};

#[derive(Parser)]
#[command(name = "conductor", version, about = "Single-cluster batch job scheduler and executor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API front-end.
    Api,
    /// Run the scheduler daemon. Single-writer per cluster.
    Scheduler,
    /// Run an executor worker.
    Worker {
        /// Worker id; defaults to "<hostname>_<pid>".
        #[arg(long)]
        id: Option<String>,
        /// Advertised CPU capacity; defaults to the host's logical CPU count.
        #[arg(long)]
        cpus: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;
    conductor::logging::init(&config);
    config.ensure_directories().context("creating work/script directories")?;

    match cli.command {
        Commands::Api => run_api(config).await,
        Commands::Scheduler => run_scheduler(config).await,
        Commands::Worker { id, cpus } => run_worker(config, id, cpus).await,
    }
}

// ============================================================================
// API FRONT-END
// ============================================================================

async fn run_api(config: Config) -> Result<()> {
    let db = db::open_pool(&config.database_url).context("opening database")?;
    let host = config.api_host.clone();
    let port = config.api_port;
    let state = Arc::new(conductor::api::AppState { db, config });
    conductor::api::run(state, &host, port).await
}

// ============================================================================
// SCHEDULER
// ============================================================================

async fn run_scheduler(config: Config) -> Result<()> {
    let db = db::open_pool(&config.database_url).context("opening database")?;
    let kv: Arc<dyn Kv> = Arc::new(RedisKv::connect(&config.kv_url).await.context("connecting to kv store")?);
    let queue: Arc<dyn Queue> = Arc::new(
        RedisQueue::connect(&config.kv_url, &config.queue_name)
            .await
            .context("connecting to work queue")?,
    );
    let registry = Arc::new(WorkerRegistry::new(kv.clone(), config.heartbeat_interval()));
    let accounting = Arc::new(ResourceAccounting::new(kv, registry, config.total_cpus));
    let cleanup = CleanupManager::with_defaults(CleanupConfig::from(&config));

    let mut scheduler = Scheduler::new(
        db,
        queue,
        accounting,
        config.node_name.clone(),
        cleanup,
        config.check_interval(),
    );

    log::info!("scheduler starting, check_interval={:?}", config.check_interval());
    let shutdown = shutdown_signal();
    tokio::select! {
        _ = scheduler.run() => unreachable!("Scheduler::run never returns"),
        _ = shutdown => {
            log::info!("scheduler shutting down on signal");
            Ok(())
        }
    }
}

// ============================================================================
// EXECUTOR WORKER
// ============================================================================

async fn run_worker(config: Config, manual_id: Option<String>, manual_cpus: Option<u32>) -> Result<()> {
    let worker_id = manual_id.unwrap_or_else(|| {
        format!("{}_{}", config.node_name, std::process::id())
    });
    let cpus = manual_cpus.unwrap_or_else(|| num_cpus::get() as u32);

    let db = db::open_pool(&config.database_url).context("opening database")?;
    let kv: Arc<dyn Kv> = Arc::new(RedisKv::connect(&config.kv_url).await.context("connecting to kv store")?);
    let queue: Arc<dyn Queue> = Arc::new(
        RedisQueue::connect(&config.kv_url, &config.queue_name)
            .await
            .context("connecting to work queue")?,
    );
    let registry = Arc::new(WorkerRegistry::new(kv.clone(), config.heartbeat_interval()));
    let accounting = Arc::new(ResourceAccounting::new(kv, registry.clone(), config.total_cpus));

    // Worker startup recovery pipeline: runs once, before the
    // heartbeat or the main dispatch loop starts.
    {
        let conn = db.get().context("db connection for startup recovery")?;
        conductor::cleanup::recovery::run_all(
            &conn,
            queue.as_ref(),
            accounting.as_ref(),
            config.worker_timeout_recovery_hours,
        )
        .await
        .context("worker startup recovery")?;
    }

    let heartbeat = Heartbeat::new(registry, worker_id.clone(), config.heartbeat_interval());
    let stop_heartbeat = heartbeat
        .start(cpus, &config.node_name)
        .await
        .context("starting heartbeat")?;

    let executor = Arc::new(Executor::new(
        db,
        accounting,
        config.node_name.clone(),
        config.job_work_base_dir.clone(),
        config.script_dir.clone(),
    ));

    log::info!("worker {worker_id} active, advertising {cpus} cpus");

    let shutdown = Arc::new(AtomicBool::new(false));
    let sig_shutdown = shutdown.clone();
    tokio::spawn(async move {
        signal::ctrl_c().await.ok();
        log::warn!("worker received interrupt, finishing in-flight job then stopping");
        sig_shutdown.store(true, Ordering::SeqCst);
    });

    while !shutdown.load(Ordering::SeqCst) {
        match queue.dequeue().await {
            Ok(Some(token)) => {
                heartbeat.mark_busy().await.ok();
                if let Err(err) = executor.execute(token.job_id).await {
                    log::error!("executing job {} failed: {err}", token.job_id);
                }
                heartbeat.mark_ready().await.ok();
            }
            Ok(None) => sleep(Duration::from_millis(200)).await,
            Err(err) => {
                log::error!("dequeue failed: {err}");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }

    let _ = stop_heartbeat.send(true);
    log::info!("worker {worker_id} shut down");
    Ok(())
}

async fn shutdown_signal() {
    signal::ctrl_c().await.ok();
    log::warn!("received interrupt");
}
