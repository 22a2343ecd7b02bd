// src/queue.rs
//
// =============================================================================
// CONDUCTOR: WORK-QUEUE CLIENT (v 0.1)
// =============================================================================
//
// Opaque FIFO queue of dispatch tokens: `(function-name, job_id)` plus a
// per-job timeout. At-least-once delivery is assumed; idempotency is the
// executor's responsibility (LOAD's state check on dequeue).

use crate::error::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchToken {
    pub function: String,
    pub job_id: i64,
    pub timeout_secs: u64,
}

impl DispatchToken {
    pub fn execute_job(job_id: i64, timeout_secs: u64) -> Self {
        Self {
            function: "execute_job".to_string(),
            job_id,
            timeout_secs,
        }
    }

    /// Deterministic id used for RQ-style de-duplication on re-enqueue,
    /// e.g. by pending-job recovery after a crash.
    pub fn dedup_id(&self) -> String {
        format!("{}:{}", self.function, self.job_id)
    }
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, token: DispatchToken) -> Result<()>;
    /// Non-blocking pop; `None` if the queue is empty.
    async fn dequeue(&self) -> Result<Option<DispatchToken>>;
}

pub struct RedisQueue {
    conn: redis::aio::ConnectionManager,
    list_key: String,
    inflight_key: String,
}

impl RedisQueue {
    pub async fn connect(url: &str, queue_name: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            list_key: format!("{queue_name}:list"),
            inflight_key: format!("{queue_name}:inflight"),
        })
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn enqueue(&self, token: DispatchToken) -> Result<()> {
        let mut conn = self.conn.clone();
        let dedup_id = token.dedup_id();
        let added: bool = conn.sadd(&self.inflight_key, &dedup_id).await?;
        if !added {
            // Already queued or in flight; RQ-style de-duplication.
            return Ok(());
        }
        let payload = serde_json::to_string(&token)?;
        conn.lpush(&self.list_key, payload).await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<DispatchToken>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.rpop(&self.list_key, None).await?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let token: DispatchToken = serde_json::from_str(&payload)?;
        conn.srem(&self.inflight_key, token.dedup_id()).await?;
        Ok(Some(token))
    }
}

/// In-memory fake sharing the `Queue` trait for tests.
#[derive(Default)]
pub struct InMemoryQueue {
    items: Mutex<VecDeque<DispatchToken>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(&self, token: DispatchToken) -> Result<()> {
        let mut items = self.items.lock().unwrap();
        if items.iter().any(|t| t.dedup_id() == token.dedup_id()) {
            return Ok(());
        }
        items.push_back(token);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<DispatchToken>> {
        Ok(self.items.lock().unwrap().pop_front())
    }
}

/// Executor dispatch tokens get a 24h per-job deadline.
pub const EXECUTOR_DISPATCH_TIMEOUT: Duration = Duration::from_secs(24 * 3600);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_is_deduplicated_by_job_id() {
        let q = InMemoryQueue::new();
        q.enqueue(DispatchToken::execute_job(1, 60)).await.unwrap();
        q.enqueue(DispatchToken::execute_job(1, 60)).await.unwrap();
        let first = q.dequeue().await.unwrap();
        let second = q.dequeue().await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let q = InMemoryQueue::new();
        q.enqueue(DispatchToken::execute_job(1, 60)).await.unwrap();
        q.enqueue(DispatchToken::execute_job(2, 60)).await.unwrap();
        assert_eq!(q.dequeue().await.unwrap().unwrap().job_id, 1);
        assert_eq!(q.dequeue().await.unwrap().unwrap().job_id, 2);
    }
}
