// src/kv/memory.rs
//
// In-memory fake implementing the same `Kv` trait the Redis backend does,
// for scheduler/registry/resource-accounting tests that need no real Redis.
// TTL is emulated with wall-clock `Instant`s rather than a background
// sweeper; expired keys are pruned lazily on access.

use super::Kv;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

#[derive(Clone, Default)]
struct HashEntry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl HashEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

#[derive(Default)]
pub struct InMemoryKv {
    strings: Mutex<HashMap<String, Entry>>,
    hashes: Mutex<HashMap<String, HashEntry>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Kv for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut map = self.strings.lock().unwrap();
        if let Some(entry) = map.get(key) {
            if entry.is_expired() {
                map.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.strings.lock().unwrap().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.strings.lock().unwrap().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.strings.lock().unwrap().remove(key);
        self.hashes.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.get(key).await?.is_some() {
            return Ok(true);
        }
        let mut hashes = self.hashes.lock().unwrap();
        if let Some(entry) = hashes.get(key) {
            if entry.is_expired() {
                hashes.remove(key);
                return Ok(false);
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut found = false;
        if let Some(entry) = self.strings.lock().unwrap().get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
            found = true;
        }
        if !found {
            if let Some(entry) = self.hashes.lock().unwrap().get_mut(key) {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
            }
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let map = self.strings.lock().unwrap();
        match map.get(key) {
            None => Ok(-2),
            Some(Entry { expires_at: None, .. }) => Ok(-1),
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => Ok(at.saturating_duration_since(Instant::now()).as_secs() as i64),
        }
    }

    async fn incrby(&self, key: &str, delta: i64) -> Result<i64> {
        let mut map = self.strings.lock().unwrap();
        let entry = map.entry(key.to_string()).or_insert(Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        let current: i64 = entry.value.parse().unwrap_or(0);
        let next = current + delta;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn decrby(&self, key: &str, delta: i64) -> Result<i64> {
        self.incrby(key, -delta).await
    }

    async fn hset(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        let mut hashes = self.hashes.lock().unwrap();
        let entry = hashes.entry(key.to_string()).or_default();
        if entry.is_expired() {
            entry.fields.clear();
            entry.expires_at = None;
        }
        for (field, value) in fields {
            entry.fields.insert(field.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut hashes = self.hashes.lock().unwrap();
        if let Some(entry) = hashes.get(key) {
            if entry.is_expired() {
                hashes.remove(key);
                return Ok(HashMap::new());
            }
            return Ok(entry.fields.clone());
        }
        Ok(HashMap::new())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let strings = self.strings.lock().unwrap();
        let mut hashes = self.hashes.lock().unwrap();
        hashes.retain(|_, v| !v.is_expired());
        let mut out: Vec<String> = strings
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && !v.is_expired())
            .map(|(k, _)| k.clone())
            .chain(
                hashes
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned(),
            )
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incrby_and_decrby_track_a_counter() {
        let kv = InMemoryKv::new();
        assert_eq!(kv.incrby("c", 3).await.unwrap(), 3);
        assert_eq!(kv.decrby("c", 1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let kv = InMemoryKv::new();
        kv.set_ex("k", "v", 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_matches_by_prefix_across_strings_and_hashes() {
        let kv = InMemoryKv::new();
        kv.set("worker:a", "x").await.unwrap();
        kv.hset("worker:b", &[("cpus", "4")]).await.unwrap();
        kv.set("resource:allocated_cpus", "0").await.unwrap();
        let mut found = kv.keys("worker:").await.unwrap();
        found.sort();
        assert_eq!(found, vec!["worker:a".to_string(), "worker:b".to_string()]);
    }

    #[tokio::test]
    async fn expire_on_a_hash_key_is_honored_by_keys_and_hgetall() {
        let kv = InMemoryKv::new();
        kv.hset("worker:w0", &[("cpus", "4")]).await.unwrap();
        kv.expire("worker:w0", 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(kv.keys("worker:").await.unwrap().is_empty());
        assert!(kv.hgetall("worker:w0").await.unwrap().is_empty());
        assert!(!kv.exists("worker:w0").await.unwrap());
    }
}
