// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis connection handling, key generation and script registry.
//!
//! All multi-key mutations go through Lua scripts so each operation is atomic
//! on the server. Scripts are loaded once per process via `include_str!` and
//! sent with EVALSHA by the `redis` crate.

use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Scripted queue enqueue.
pub static ENQUEUE: LazyLock<Script> =
    LazyLock::new(|| Script::new(include_str!("lua/enqueue.lua")));
/// Scripted queue lease with concurrency gates.
pub static LEASE: LazyLock<Script> = LazyLock::new(|| Script::new(include_str!("lua/lease.lua")));
/// Scripted lease extension.
pub static EXTEND_LEASE: LazyLock<Script> =
    LazyLock::new(|| Script::new(include_str!("lua/extend_lease.lua")));
/// Scripted dequeue (complete).
pub static DEQUEUE: LazyLock<Script> =
    LazyLock::new(|| Script::new(include_str!("lua/dequeue.lua")));
/// Scripted requeue at a new time.
pub static REQUEUE: LazyLock<Script> =
    LazyLock::new(|| Script::new(include_str!("lua/requeue.lua")));
/// Scripted requeue of all items sharing a job ID.
pub static REQUEUE_BY_JOB: LazyLock<Script> =
    LazyLock::new(|| Script::new(include_str!("lua/requeue_by_job.lua")));
/// Scripted unconditional removal of an unleased item.
pub static REMOVE: LazyLock<Script> =
    LazyLock::new(|| Script::new(include_str!("lua/remove.lua")));
/// Scripted pause lease (first phase of resume).
pub static PAUSE_LEASE: LazyLock<Script> =
    LazyLock::new(|| Script::new(include_str!("lua/pause_lease.lua")));
/// Scripted pause consume (second phase of resume).
pub static PAUSE_CONSUME: LazyLock<Script> =
    LazyLock::new(|| Script::new(include_str!("lua/pause_consume.lua")));
/// Scripted step output write with dedup and limits.
pub static SAVE_STEP: LazyLock<Script> =
    LazyLock::new(|| Script::new(include_str!("lua/save_step.lua")));
/// Scripted batch append with pointer rotation.
pub static BATCH_APPEND: LazyLock<Script> =
    LazyLock::new(|| Script::new(include_str!("lua/batch_append.lua")));
/// Scripted multi-event batch append in one round trip.
pub static BATCH_APPEND_BULK: LazyLock<Script> =
    LazyLock::new(|| Script::new(include_str!("lua/batch_append_bulk.lua")));
/// Scripted batch claim for flushing.
pub static BATCH_CLAIM: LazyLock<Script> =
    LazyLock::new(|| Script::new(include_str!("lua/batch_claim.lua")));
/// Scripted debounce upsert.
pub static DEBOUNCE_UPSERT: LazyLock<Script> =
    LazyLock::new(|| Script::new(include_str!("lua/debounce_upsert.lua")));
/// Scripted config-lease acquire or renew.
pub static LEASE_ACQUIRE: LazyLock<Script> =
    LazyLock::new(|| Script::new(include_str!("lua/lease_acquire.lua")));
/// Scripted config-lease release.
pub static LEASE_RELEASE: LazyLock<Script> =
    LazyLock::new(|| Script::new(include_str!("lua/lease_release.lua")));

/// A shared Redis connection.
#[derive(Clone)]
pub struct RedisHandle {
    manager: ConnectionManager,
}

impl std::fmt::Debug for RedisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisHandle").finish_non_exhaustive()
    }
}

impl RedisHandle {
    /// Connect to Redis with automatic reconnection.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| EngineError::KvUnavailable(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| EngineError::KvUnavailable(e.to_string()))?;
        Ok(Self { manager })
    }

    /// A cloned connection for one operation. `ConnectionManager` multiplexes
    /// internally; clones are cheap.
    pub fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

/// Key namespace generator. Every key carries the instance prefix so several
/// engines can share one Redis database.
#[derive(Debug, Clone)]
pub struct KeyGen {
    prefix: String,
}

impl KeyGen {
    /// A key generator with the given instance prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Default generator with the `strand` prefix.
    pub fn default_prefix() -> Self {
        Self::new("strand")
    }

    /// JSON blob of one queue item.
    pub fn queue_item(&self, item_id: &str) -> String {
        format!("{{{}}}:q:item:{item_id}", self.prefix)
    }

    /// Per-partition zset of item IDs scored by ready-at time.
    pub fn queue_sorted(&self, partition: &str) -> String {
        format!("{{{}}}:q:sorted:{partition}", self.prefix)
    }

    /// Global zset of partitions scored by earliest item time.
    pub fn queue_partitions(&self) -> String {
        format!("{{{}}}:q:partitions", self.prefix)
    }

    /// Hash of live leases: item ID to `lease_id|expiry_ms`.
    pub fn queue_leases(&self) -> String {
        format!("{{{}}}:q:leases", self.prefix)
    }

    /// Set of item IDs belonging to one job.
    pub fn queue_job(&self, job_id: &str) -> String {
        format!("{{{}}}:q:job:{job_id}", self.prefix)
    }

    /// Enqueue idempotency record for one item ID. Outlives the item itself.
    pub fn queue_idempotency(&self, item_id: &str) -> String {
        format!("{{{}}}:q:idem:{item_id}", self.prefix)
    }

    /// Zset of in-flight item IDs for one concurrency key, scored by lease
    /// expiry.
    pub fn concurrency(&self, key: &str) -> String {
        format!("{{{}}}:q:conc:{key}", self.prefix)
    }

    /// Hash of run metadata.
    pub fn run_metadata(&self, run_id: &str) -> String {
        format!("{{{}}}:s:meta:{run_id}", self.prefix)
    }

    /// Hash of step outputs for a run.
    pub fn run_steps(&self, run_id: &str) -> String {
        format!("{{{}}}:s:steps:{run_id}", self.prefix)
    }

    /// List forming the run's step stack (ordered step IDs).
    pub fn run_stack(&self, run_id: &str) -> String {
        format!("{{{}}}:s:stack:{run_id}", self.prefix)
    }

    /// JSON blob of the run's triggering events.
    pub fn run_events(&self, run_id: &str) -> String {
        format!("{{{}}}:s:events:{run_id}", self.prefix)
    }

    /// Idempotency marker for run creation.
    pub fn run_idempotency(&self, key: &str) -> String {
        format!("{{{}}}:s:idem:{key}", self.prefix)
    }

    /// JSON blob of one pause.
    pub fn pause(&self, pause_id: &str) -> String {
        format!("{{{}}}:p:{pause_id}", self.prefix)
    }

    /// Set of pause IDs waiting on one event name.
    pub fn pause_event_index(&self, event_name: &str) -> String {
        format!("{{{}}}:p:evt:{event_name}", self.prefix)
    }

    /// Pause ID registered for an invoke correlation ID.
    pub fn pause_correlation(&self, correlation_id: &str) -> String {
        format!("{{{}}}:p:corr:{correlation_id}", self.prefix)
    }

    /// Pause ID registered for a signal name.
    pub fn pause_signal(&self, signal: &str) -> String {
        format!("{{{}}}:p:sig:{signal}", self.prefix)
    }

    /// Set of pause IDs belonging to one run, swept at terminal transitions.
    pub fn pause_run_index(&self, run_id: &str) -> String {
        format!("{{{}}}:p:run:{run_id}", self.prefix)
    }

    /// Pointer from `(function, key)` to the current open batch ID.
    pub fn batch_pointer(&self, function_id: &str, key: &str) -> String {
        format!("{{{}}}:b:ptr:{function_id}:{key}", self.prefix)
    }

    /// List of events in one batch.
    pub fn batch_items(&self, batch_id: &str) -> String {
        format!("{{{}}}:b:items:{batch_id}", self.prefix)
    }

    /// Batch status string (`open`, `started`).
    pub fn batch_status(&self, batch_id: &str) -> String {
        format!("{{{}}}:b:status:{batch_id}", self.prefix)
    }

    /// Pointer from `(function, key)` to the current debounce ID.
    pub fn debounce_pointer(&self, function_id: &str, key: &str) -> String {
        format!("{{{}}}:d:ptr:{function_id}:{key}", self.prefix)
    }

    /// Hash of one debounce's payload and flags.
    pub fn debounce(&self, debounce_id: &str) -> String {
        format!("{{{}}}:d:item:{debounce_id}", self.prefix)
    }

    /// Rate limit window counter.
    pub fn rate_limit(&self, key: &str, window_start_ms: u64) -> String {
        format!("{{{}}}:rl:{key}:{window_start_ms}", self.prefix)
    }

    /// Config lease key for singleton background roles.
    pub fn config_lease(&self, role: &str) -> String {
        format!("{{{}}}:lease:{role}", self.prefix)
    }
}

/// Retry a transient KV operation with fixed spacing. Non-transient errors
/// surface immediately.
pub async fn with_retries<T, F, Fut>(attempts: u32, spacing: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last = None;
    for attempt in 0..attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => {
                tracing::warn!(attempt, error = %e, "transient kv failure, retrying");
                last = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(spacing).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| EngineError::KvUnavailable("retries exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_share_hash_tag() {
        let kg = KeyGen::new("s1");
        // All keys share one {tag} so Lua scripts touch a single cluster slot.
        assert!(kg.queue_item("a").starts_with("{s1}:"));
        assert!(kg.queue_partitions().starts_with("{s1}:"));
        assert!(kg.pause("p").starts_with("{s1}:"));
    }

    #[tokio::test]
    async fn test_with_retries_gives_up_on_logic_errors() {
        let mut calls = 0u32;
        let result: Result<()> = with_retries(5, Duration::from_millis(1), || {
            calls += 1;
            async move { Err(EngineError::NoneReady) }
        })
        .await;
        assert!(matches!(result, Err(EngineError::NoneReady)));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_with_retries_retries_transient() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retries(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::KvUnavailable("down".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
