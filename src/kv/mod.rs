// src/kv/mod.rs
//
// =============================================================================
// CONDUCTOR: KEY-VALUE STORE CLIENT (v 0.1)
// =============================================================================
//
// Trait-object abstraction over the Redis-like ephemeral store: one trait,
// a real backend, and a lightweight in-memory fake sharing the same
// interface so scheduling/accounting logic under test is identical to
// production.
//
// Key namespaces: `worker:<id>`, `resource:allocated_cpus`.

mod memory;
mod redis_backed;

pub use memory::InMemoryKv;
pub use redis_backed::RedisKv;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;
    /// Seconds of TTL remaining; negative values follow Redis conventions
    /// (-1 = no TTL, -2 = missing key).
    async fn ttl(&self, key: &str) -> Result<i64>;
    async fn incrby(&self, key: &str, delta: i64) -> Result<i64>;
    async fn decrby(&self, key: &str, delta: i64) -> Result<i64>;
    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    /// All keys matching `prefix*`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}
