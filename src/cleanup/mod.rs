// src/cleanup/mod.rs
//
// =============================================================================
// CONDUCTOR: CLEANUP / RECONCILIATION ENGINE (v 0.1)
// =============================================================================
//
// An explicit vector of strategy values built once at startup, rather than
// discovered by reflection at runtime — topologically sorted by
// `depends_on` and then stably sorted by `priority` within a layer.

pub mod recovery;
pub mod strategies;

use crate::error::ConductorError;
use crate::resources::ResourceAccounting;
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// One independent repair routine. Each strategy owns its trigger predicate
/// and repair body; the manager only owns scheduling and error isolation.
pub trait CleanupStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn interval(&self) -> Duration;
    fn priority(&self) -> u8;
    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }
    fn enabled_by_default(&self) -> bool {
        true
    }

    /// May veto this invocation (e.g. a strategy disabled via config).
    fn before(&self) -> bool {
        true
    }

    /// Performs the repair inside the given connection; the manager wraps
    /// this in its own short transaction. Returns the count of rows
    /// repaired.
    fn do_cleanup(
        &self,
        conn: &Connection,
        accounting: &ResourceAccountingHandle,
    ) -> crate::error::Result<usize>;

    fn after(&self, _count: usize) {}

    fn on_error(&self, err: &ConductorError) {
        log::error!("cleanup strategy {} failed: {err}", self.name());
    }
}

/// Cache mutations a strategy needs (allocate/release) without giving it a
/// full `Arc<ResourceAccounting>` plus async runtime coupling — strategies
/// run synchronously inside a blocking scheduler tick, so this handle
/// defers the async cache call to the caller via a queued delta.
pub struct ResourceAccountingHandle<'a> {
    deltas: std::cell::RefCell<Vec<i64>>,
    _accounting: &'a ResourceAccounting,
}

impl<'a> ResourceAccountingHandle<'a> {
    pub fn new(accounting: &'a ResourceAccounting) -> Self {
        Self {
            deltas: std::cell::RefCell::new(Vec::new()),
            _accounting: accounting,
        }
    }

    /// Queues a cache decrement of `n` CPUs, applied after the strategy
    /// returns. Only call this when the prior allocation status was
    /// ALLOCATED — a RESERVED row was never added to the cache.
    pub fn queue_release(&self, n: i64) {
        self.deltas.borrow_mut().push(-n);
    }

    pub fn take_deltas(&self) -> Vec<i64> {
        std::mem::take(&mut self.deltas.borrow_mut())
    }
}

pub struct CleanupManager {
    strategies: Vec<Box<dyn CleanupStrategy>>,
    last_run: HashMap<&'static str, Instant>,
}

#[derive(Debug, Clone, Copy)]
pub struct CleanupConfig {
    pub stale_reservation_minutes: i64,
    pub stuck_job_hours: i64,
    pub old_job_days: i64,
    pub old_job_cleanup_enabled: bool,
}

impl From<&crate::config::Config> for CleanupConfig {
    fn from(cfg: &crate::config::Config) -> Self {
        Self {
            stale_reservation_minutes: cfg.stale_reservation_minutes,
            stuck_job_hours: cfg.stuck_job_hours,
            old_job_days: cfg.old_job_days,
            old_job_cleanup_enabled: cfg.old_job_cleanup_enabled,
        }
    }
}

impl CleanupManager {
    /// Builds the manager with the four default strategies, topologically
    /// sorted by `depends_on` then stably sorted by `priority` within a
    /// dependency layer.
    pub fn with_defaults(cfg: CleanupConfig) -> Self {
        let strategies: Vec<Box<dyn CleanupStrategy>> = vec![
            Box::new(strategies::CompletedJobCleanup),
            Box::new(strategies::StaleReservationCleanup {
                max_age_minutes: cfg.stale_reservation_minutes,
            }),
            Box::new(strategies::StuckJobCleanup {
                max_age_hours: cfg.stuck_job_hours,
            }),
            Box::new(strategies::OldJobCleanup {
                enabled: cfg.old_job_cleanup_enabled,
                max_age_days: cfg.old_job_days,
            }),
        ];
        Self::new(strategies)
    }

    pub fn new(strategies: Vec<Box<dyn CleanupStrategy>>) -> Self {
        let ordered = topological_sort(strategies);
        Self {
            strategies: ordered,
            last_run: HashMap::new(),
        }
    }

    /// Runs every strategy whose interval has elapsed, each inside its own
    /// short transaction. One strategy's failure rolls back only its own
    /// transaction and does not abort the others.
    pub async fn tick(&mut self, conn: &mut Connection, accounting: &ResourceAccounting) {
        let now = Instant::now();
        for strategy in &self.strategies {
            if !strategy.enabled_by_default() {
                continue;
            }
            let due = self
                .last_run
                .get(strategy.name())
                .map(|last| now.duration_since(*last) >= strategy.interval())
                .unwrap_or(true);
            if !due || !strategy.before() {
                continue;
            }

            let handle = ResourceAccountingHandle::new(accounting);
            let result = (|| -> crate::error::Result<usize> {
                let tx = conn.transaction()?;
                let count = strategy.do_cleanup(&tx, &handle)?;
                tx.commit()?;
                Ok(count)
            })();

            self.last_run.insert(strategy.name(), now);

            match result {
                Ok(count) => {
                    if count > 0 {
                        log::info!("{}: repaired {count} row(s)", strategy.name());
                    }
                    strategy.after(count);
                    for delta in handle.take_deltas() {
                        if delta < 0 {
                            let _ = accounting.release(-delta).await;
                        } else if delta > 0 {
                            let _ = accounting.allocate(delta).await;
                        }
                    }
                }
                Err(err) => strategy.on_error(&err),
            }
        }
    }
}

fn topological_sort(strategies: Vec<Box<dyn CleanupStrategy>>) -> Vec<Box<dyn CleanupStrategy>> {
    let mut by_name: HashMap<&'static str, usize> = HashMap::new();
    for (i, s) in strategies.iter().enumerate() {
        by_name.insert(s.name(), i);
    }

    let mut visited: HashSet<&'static str> = HashSet::new();
    let mut ordered_indices: Vec<usize> = Vec::with_capacity(strategies.len());

    fn visit(
        idx: usize,
        strategies: &[Box<dyn CleanupStrategy>],
        by_name: &HashMap<&'static str, usize>,
        visited: &mut HashSet<&'static str>,
        ordered: &mut Vec<usize>,
    ) {
        let name = strategies[idx].name();
        if visited.contains(name) {
            return;
        }
        visited.insert(name);
        for dep in strategies[idx].depends_on() {
            if let Some(&dep_idx) = by_name.get(dep) {
                visit(dep_idx, strategies, by_name, visited, ordered);
            }
        }
        ordered.push(idx);
    }

    // Visit in priority order so layers without dependency constraints still
    // come out stably sorted by priority.
    let mut order: Vec<usize> = (0..strategies.len()).collect();
    order.sort_by_key(|&i| strategies[i].priority());
    for idx in order {
        visit(idx, &strategies, &by_name, &mut visited, &mut ordered_indices);
    }

    let mut out: Vec<Option<Box<dyn CleanupStrategy>>> = strategies.into_iter().map(Some).collect();
    ordered_indices
        .into_iter()
        .map(|i| out[i].take().expect("each index visited once"))
        .collect()
}
