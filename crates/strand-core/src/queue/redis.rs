// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-backed queue.
//!
//! Item blobs, per-partition zsets and the global partition pointer live under
//! one hash tag so every Lua script runs on a single cluster slot. The zset
//! score is the authoritative ready-at time; item JSON is rewritten only on
//! requeue.

use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::kv::{self, KeyGen, RedisHandle};

use super::{
    ConcurrencyLimitGetter, ENQUEUE_IDEMPOTENCY_TTL, LeaseId, Partition, Queue, QueueItem,
};

/// Queue over Redis.
pub struct RedisQueue {
    kv: RedisHandle,
    keys: KeyGen,
    limits: Arc<dyn ConcurrencyLimitGetter>,
}

impl RedisQueue {
    /// Create a queue over an existing connection.
    pub fn new(kv: RedisHandle, keys: KeyGen, limits: Arc<dyn ConcurrencyLimitGetter>) -> Self {
        Self { kv, keys, limits }
    }

    async fn load_item(&self, item_id: &str) -> Result<QueueItem> {
        let mut conn = self.kv.conn();
        let blob: Option<String> = conn.get(self.keys.queue_item(item_id)).await?;
        let blob = blob.ok_or(EngineError::NoneReady)?;
        Ok(serde_json::from_str(&blob)?)
    }

    fn gate_keys_and_limits(&self, item: &QueueItem) -> (Vec<String>, Vec<u32>) {
        let mut keys = Vec::with_capacity(item.concurrency.len());
        let mut limits = Vec::with_capacity(item.concurrency.len());
        for gate in &item.concurrency {
            keys.push(self.keys.concurrency(&gate.key));
            limits.push(self.limits.limit_for(item.function_id, gate).unwrap_or(gate.limit));
        }
        (keys, limits)
    }
}

#[async_trait::async_trait]
impl Queue for RedisQueue {
    async fn enqueue(&self, item: &QueueItem) -> Result<()> {
        let blob = serde_json::to_string(item)?;
        let partition = item.partition();
        let mut conn = self.kv.conn();
        let reply: String = kv::ENQUEUE
            .key(self.keys.queue_item(&item.id))
            .key(self.keys.queue_sorted(&partition))
            .key(self.keys.queue_partitions())
            .key(self.keys.queue_job(&item.job_id))
            .key(self.keys.queue_idempotency(&item.id))
            .arg(&blob)
            .arg(&item.id)
            .arg(item.at_ms)
            .arg(&partition)
            .arg(ENQUEUE_IDEMPOTENCY_TTL.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        match reply.as_str() {
            "ok" => Ok(()),
            "dup" => Err(EngineError::Duplicate(item.id.clone())),
            other => Err(EngineError::ScriptError {
                script: "enqueue".to_string(),
                message: other.to_string(),
            }),
        }
    }

    async fn peek_partitions(&self, now_ms: u64, limit: usize) -> Result<Vec<Partition>> {
        let mut conn = self.kv.conn();
        let rows: Vec<(String, f64)> = conn
            .zrangebyscore_limit_withscores(
                self.keys.queue_partitions(),
                f64::NEG_INFINITY,
                now_ms as f64,
                0,
                limit as isize,
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|(key, score)| Partition { key, earliest_ms: score as u64 })
            .collect())
    }

    async fn peek(&self, partition: &str, now_ms: u64, limit: usize) -> Result<Vec<QueueItem>> {
        let mut conn = self.kv.conn();
        let rows: Vec<(String, f64)> = conn
            .zrangebyscore_limit_withscores(
                self.keys.queue_sorted(partition),
                f64::NEG_INFINITY,
                now_ms as f64,
                0,
                limit as isize,
            )
            .await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = rows.iter().map(|(id, _)| id.clone()).collect();
        let leases: Vec<Option<String>> = conn.hget(self.keys.queue_leases(), &ids).await?;

        let mut out = Vec::new();
        for ((id, score), lease) in rows.into_iter().zip(leases) {
            if let Some(raw) = lease {
                if let Some((_, expiry)) = raw.split_once('|') {
                    if expiry.parse::<u64>().unwrap_or(0) > now_ms {
                        continue;
                    }
                }
            }
            let blob: Option<String> = conn.get(self.keys.queue_item(&id)).await?;
            let Some(blob) = blob else { continue };
            let mut item: QueueItem = serde_json::from_str(&blob)?;
            item.at_ms = score as u64;
            out.push(item);
        }
        Ok(out)
    }

    async fn lease(&self, item_id: &str, duration: Duration, now_ms: u64) -> Result<LeaseId> {
        let item = self.load_item(item_id).await?;
        let (gate_keys, gate_limits) = self.gate_keys_and_limits(&item);
        let lease = LeaseId::new(now_ms, duration);

        let mut script = kv::LEASE.prepare_invoke();
        script
            .key(self.keys.queue_item(item_id))
            .key(self.keys.queue_leases());
        for key in &gate_keys {
            script.key(key.as_str());
        }
        script
            .arg(item_id)
            .arg(now_ms)
            .arg(lease.0.to_string())
            .arg(lease.expires_at_ms());
        for limit in &gate_limits {
            script.arg(*limit);
        }

        let mut conn = self.kv.conn();
        let reply: String = script.invoke_async(&mut conn).await?;
        match reply.as_str() {
            "ok" => Ok(lease),
            "missing" => Err(EngineError::NoneReady),
            "leased" => Err(EngineError::AlreadyLeased(item_id.to_string())),
            other => {
                if let Some(idx) = other.strip_prefix("conc:") {
                    let i: usize = idx.parse().unwrap_or(1);
                    let key = item
                        .concurrency
                        .get(i.saturating_sub(1))
                        .map(|g| g.key.clone())
                        .unwrap_or_default();
                    Err(EngineError::ConcurrencyLimited(key))
                } else {
                    Err(EngineError::ScriptError {
                        script: "lease".to_string(),
                        message: other.to_string(),
                    })
                }
            }
        }
    }

    async fn extend_lease(
        &self,
        item_id: &str,
        lease: LeaseId,
        duration: Duration,
        now_ms: u64,
    ) -> Result<LeaseId> {
        let item = self.load_item(item_id).await?;
        let (gate_keys, _) = self.gate_keys_and_limits(&item);
        let next = LeaseId::new(now_ms, duration);

        let mut script = kv::EXTEND_LEASE.prepare_invoke();
        script.key(self.keys.queue_leases());
        for key in &gate_keys {
            script.key(key.as_str());
        }
        script
            .arg(item_id)
            .arg(lease.0.to_string())
            .arg(next.0.to_string())
            .arg(next.expires_at_ms())
            .arg(now_ms);

        let mut conn = self.kv.conn();
        let reply: String = script.invoke_async(&mut conn).await?;
        match reply.as_str() {
            "ok" => Ok(next),
            "lost" => Err(EngineError::LeaseLost(item_id.to_string())),
            other => Err(EngineError::ScriptError {
                script: "extend_lease".to_string(),
                message: other.to_string(),
            }),
        }
    }

    async fn dequeue(&self, item_id: &str, lease: LeaseId) -> Result<()> {
        let item = self.load_item(item_id).await?;
        let partition = item.partition();
        let (gate_keys, _) = self.gate_keys_and_limits(&item);

        let mut script = kv::DEQUEUE.prepare_invoke();
        script
            .key(self.keys.queue_item(item_id))
            .key(self.keys.queue_sorted(&partition))
            .key(self.keys.queue_partitions())
            .key(self.keys.queue_leases())
            .key(self.keys.queue_job(&item.job_id));
        for key in &gate_keys {
            script.key(key.as_str());
        }
        script.arg(item_id).arg(lease.0.to_string()).arg(&partition);

        let mut conn = self.kv.conn();
        let reply: String = script.invoke_async(&mut conn).await?;
        match reply.as_str() {
            "ok" => Ok(()),
            "lost" => Err(EngineError::LeaseLost(item_id.to_string())),
            other => Err(EngineError::ScriptError {
                script: "dequeue".to_string(),
                message: other.to_string(),
            }),
        }
    }

    async fn requeue(&self, item: &QueueItem, lease: LeaseId, at_ms: u64) -> Result<()> {
        let partition = item.partition();
        let (gate_keys, _) = self.gate_keys_and_limits(item);
        let mut updated = item.clone();
        updated.at_ms = at_ms;
        let blob = serde_json::to_string(&updated)?;

        let mut script = kv::REQUEUE.prepare_invoke();
        script
            .key(self.keys.queue_item(&item.id))
            .key(self.keys.queue_sorted(&partition))
            .key(self.keys.queue_partitions())
            .key(self.keys.queue_leases());
        for key in &gate_keys {
            script.key(key.as_str());
        }
        script
            .arg(&item.id)
            .arg(lease.0.to_string())
            .arg(at_ms)
            .arg(&blob)
            .arg(&partition);

        let mut conn = self.kv.conn();
        let reply: String = script.invoke_async(&mut conn).await?;
        match reply.as_str() {
            "ok" => Ok(()),
            "lost" => Err(EngineError::LeaseLost(item.id.clone())),
            other => Err(EngineError::ScriptError {
                script: "requeue".to_string(),
                message: other.to_string(),
            }),
        }
    }

    async fn requeue_by_job_id(
        &self,
        partition: &str,
        job_id: &str,
        at_ms: u64,
        now_ms: u64,
    ) -> Result<()> {
        let mut conn = self.kv.conn();
        let reply: String = kv::REQUEUE_BY_JOB
            .key(self.keys.queue_job(job_id))
            .key(self.keys.queue_sorted(partition))
            .key(self.keys.queue_partitions())
            .key(self.keys.queue_leases())
            .arg(at_ms)
            .arg(partition)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        match reply.as_str() {
            "ok" => Ok(()),
            "missing" => Err(EngineError::NoneReady),
            "leased" => Err(EngineError::AlreadyLeased(job_id.to_string())),
            other => Err(EngineError::ScriptError {
                script: "requeue_by_job".to_string(),
                message: other.to_string(),
            }),
        }
    }

    async fn remove(&self, partition: &str, item_id: &str, now_ms: u64) -> Result<()> {
        let job_id = match self.load_item(item_id).await {
            Ok(item) => item.job_id,
            Err(EngineError::NoneReady) => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut conn = self.kv.conn();
        let reply: String = kv::REMOVE
            .key(self.keys.queue_item(item_id))
            .key(self.keys.queue_sorted(partition))
            .key(self.keys.queue_partitions())
            .key(self.keys.queue_leases())
            .key(self.keys.queue_job(&job_id))
            .arg(item_id)
            .arg(partition)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        match reply.as_str() {
            "ok" => Ok(()),
            "leased" => Err(EngineError::AlreadyLeased(item_id.to_string())),
            other => Err(EngineError::ScriptError {
                script: "remove".to_string(),
                message: other.to_string(),
            }),
        }
    }

    async fn backoff_partition(&self, partition: &str, until_ms: u64) -> Result<()> {
        let mut conn = self.kv.conn();
        // GT keeps the pointer monotone: never pull a partition earlier.
        let _: () = redis::cmd("ZADD")
            .arg(self.keys.queue_partitions())
            .arg("GT")
            .arg(until_ms)
            .arg(partition)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn in_flight(&self, key: &str, now_ms: u64) -> Result<u64> {
        let mut conn = self.kv.conn();
        let count: u64 = conn
            .zcount(self.keys.concurrency(key), now_ms as f64, f64::INFINITY)
            .await?;
        Ok(count)
    }
}
