// src/resources.rs
//
// =============================================================================
// CONDUCTOR: RESOURCE-ACCOUNTING MODEL (v 0.1)
// =============================================================================
//
// Answers "how many CPUs are available right now?" via a fast K/V counter
// that may lag the database but converges on `sync_from_db`. The counter is
// a distributed cache over a shared database rather than a local tally,
// since capacity here spans multiple worker processes rather than one
// machine.

use crate::db::allocation_repository;
use crate::error::Result;
use crate::kv::Kv;
use crate::registry::WorkerRegistry;
use rusqlite::Connection;
use std::sync::Arc;

const CACHE_KEY: &str = "resource:allocated_cpus";

pub struct ResourceAccounting {
    kv: Arc<dyn Kv>,
    registry: Arc<WorkerRegistry>,
    fallback_total_cpus: u32,
}

impl ResourceAccounting {
    pub fn new(kv: Arc<dyn Kv>, registry: Arc<WorkerRegistry>, fallback_total_cpus: u32) -> Self {
        Self {
            kv,
            registry,
            fallback_total_cpus,
        }
    }

    /// Sum of `cpus` over all live workers; falls back to a configured
    /// static capacity in degraded mode when no workers are registered.
    /// The schedule loop still refuses to dispatch on zero.
    pub async fn total_cpus(&self) -> Result<u32> {
        let live = self.registry.total_cpus().await?;
        if live == 0 {
            Ok(self.fallback_total_cpus)
        } else {
            Ok(live)
        }
    }

    /// Fast-path cache read; on a missing key, recomputes from the database
    /// and repopulates the cache.
    pub async fn allocated_cpus(&self, conn: &Connection) -> Result<i64> {
        match self.kv.get(CACHE_KEY).await? {
            Some(v) => Ok(v.parse().unwrap_or(0)),
            None => self.sync_from_db(conn).await,
        }
    }

    pub async fn available_cpus(&self, conn: &Connection) -> Result<i64> {
        let total = self.total_cpus().await? as i64;
        let allocated = self.allocated_cpus(conn).await?;
        Ok((total - allocated).max(0))
    }

    /// Cache-only increment. The durable status change is the caller's
    /// responsibility, performed in the same logical step.
    pub async fn allocate(&self, n: i64) -> Result<i64> {
        self.kv.incrby(CACHE_KEY, n).await
    }

    /// Cache-only decrement.
    pub async fn release(&self, n: i64) -> Result<i64> {
        self.kv.decrby(CACHE_KEY, n).await
    }

    /// Recomputes the cache from durable state: `Σ allocated_cpus WHERE
    /// status = ALLOCATED`. Invoked on scheduler startup and whenever a
    /// cache miss is observed.
    pub async fn sync_from_db(&self, conn: &Connection) -> Result<i64> {
        let sum = allocation_repository::sum_allocated_cpus(conn)?;
        self.kv.set(CACHE_KEY, &sum.to_string()).await?;
        Ok(sum)
    }
}
