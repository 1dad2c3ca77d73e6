// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The durable, partitioned work queue.
//!
//! Every unit of engine work is a [`QueueItem`] scheduled at a wall-clock
//! millisecond. Items live in per-function partitions; a global pointer index
//! orders partitions by their earliest ready item, so processing is
//! priority-by-time across the whole system. Workers lease items for a bounded
//! duration, and anything whose lease expires is picked up again by the next
//! peek, which makes crashes indistinguishable from slow workers.

mod memory;
mod redis;

pub use memory::MemoryQueue;
pub use redis::RedisQueue;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::function::ConcurrencyScope;
use crate::ids;

/// Default lease duration for queue items.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(20);

/// How long a partition backs off when every leasable item in it is blocked
/// on a concurrency limit.
pub const BACKLOG_COOLOFF: Duration = Duration::from_secs(2);

/// How long an item ID stays deduplicated after the item itself is gone.
pub const ENQUEUE_IDEMPOTENCY_TTL: Duration = Duration::from_secs(60 * 60);

/// The kind of work a queue item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Begin a new run (first dispatch).
    Start,
    /// Execute the next step of a run.
    Edge,
    /// Retry a step that errored.
    EdgeError,
    /// Wake a run whose sleep elapsed.
    Sleep,
    /// A pause timeout: resume the run with no data.
    Pause,
    /// Flush a full-or-timed-out event batch into a run.
    ScheduleBatch,
    /// A debounce quiet period elapsed: start the debounced run.
    Debounce,
    /// Cancel an in-flight run.
    Cancel,
    /// Promote a delayed job to its real partition.
    JobPromote,
    /// Flush buffered pause-index blocks.
    PauseBlockFlush,
    /// Migrate a partition's items between queue shards.
    QueueMigrate,
}

/// A concurrency gate attached to a queue item.
///
/// The evaluated key and the expression hash are frozen at enqueue time; the
/// limit is re-read from the latest function config at lease time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyKey {
    /// Scope of the gate.
    pub scope: ConcurrencyScope,
    /// Fully-evaluated key, e.g. `f:<fn-id>:customer-42`.
    pub key: String,
    /// Hash of the key expression, used to match a config limit at lease time.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expression_hash: String,
    /// Limit captured at enqueue time, used when no current config matches.
    pub limit: u32,
}

/// A unit of queue work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique item ID. Deterministic IDs dedupe enqueues.
    pub id: String,
    /// Groups retries of the same job; requeue-by-job-id targets this.
    pub job_id: String,
    /// What to do when leased.
    pub kind: ItemKind,
    /// Partition this item belongs to.
    pub function_id: Uuid,
    /// Run this item operates on, when one exists yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    /// Current attempt, 0-based.
    #[serde(default)]
    pub attempt: u32,
    /// Maximum attempts for this job.
    pub max_attempts: u32,
    /// Wall-clock millisecond at which the item becomes ready.
    pub at_ms: u64,
    /// Kind-specific payload (edge IDs, pause IDs, debounce IDs...).
    #[serde(default)]
    pub payload: Value,
    /// Concurrency gates that must all admit the item at lease time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concurrency: Vec<ConcurrencyKey>,
}

impl QueueItem {
    /// Whether another attempt is allowed after a failure of `self.attempt`.
    pub fn can_retry(&self) -> bool {
        self.attempt + 1 < self.max_attempts
    }

    /// The partition key for this item.
    pub fn partition(&self) -> String {
        self.function_id.to_string()
    }
}

/// An opaque lease on a queue item. The expiry wall-clock time is embedded in
/// the ID's timestamp bits, so holders and the store agree on expiry without
/// extra state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl LeaseId {
    /// Mint a lease expiring `duration` from `now_ms`.
    pub fn new(now_ms: u64, duration: Duration) -> Self {
        Self(ids::new_id_at(now_ms + duration.as_millis() as u64))
    }

    /// Millisecond timestamp at which this lease expires.
    pub fn expires_at_ms(&self) -> u64 {
        ids::id_millis(&self.0)
    }

    /// Whether the lease is expired at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms() <= now_ms
    }
}

/// A partition pointer returned by the global peek.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Partition key (the function ID).
    pub key: String,
    /// Earliest ready-at time among the partition's items.
    pub earliest_ms: u64,
}

/// Re-reads concurrency limits from current function configs at lease time.
pub trait ConcurrencyLimitGetter: Send + Sync {
    /// The current limit for a gate, or `None` to fall back to the limit
    /// frozen on the item.
    fn limit_for(&self, function_id: Uuid, gate: &ConcurrencyKey) -> Option<u32>;
}

/// A getter that always falls back to the enqueue-time limit.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrozenLimits;

impl ConcurrencyLimitGetter for FrozenLimits {
    fn limit_for(&self, _function_id: Uuid, _gate: &ConcurrencyKey) -> Option<u32> {
        None
    }
}

/// The durable work queue.
#[async_trait::async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue an item at its `at_ms`. Items whose ID exists, or was seen
    /// within [`ENQUEUE_IDEMPOTENCY_TTL`], return
    /// [`EngineError::Duplicate`](crate::EngineError::Duplicate). The
    /// idempotency record outlives dequeue so a completed item cannot be
    /// re-enqueued under the same ID.
    async fn enqueue(&self, item: &QueueItem) -> Result<()>;

    /// Partitions with at least one item ready at `now_ms`, ordered by their
    /// earliest item.
    async fn peek_partitions(&self, now_ms: u64, limit: usize) -> Result<Vec<Partition>>;

    /// Ready, unleased items of one partition ordered by time.
    async fn peek(&self, partition: &str, now_ms: u64, limit: usize) -> Result<Vec<QueueItem>>;

    /// Lease an item. Checks every concurrency gate against its current limit
    /// and fails with `ConcurrencyLimited` when any is at capacity, or
    /// `AlreadyLeased` when another worker holds a live lease.
    async fn lease(&self, item_id: &str, duration: Duration, now_ms: u64) -> Result<LeaseId>;

    /// Extend a held lease. Fails with `LeaseLost` when the lease no longer
    /// matches.
    async fn extend_lease(
        &self,
        item_id: &str,
        lease: LeaseId,
        duration: Duration,
        now_ms: u64,
    ) -> Result<LeaseId>;

    /// Complete and remove a leased item, releasing its concurrency slots.
    async fn dequeue(&self, item_id: &str, lease: LeaseId) -> Result<()>;

    /// Reschedule a leased item at a new time (retries). Releases concurrency
    /// slots and bumps the stored attempt to `item.attempt`.
    async fn requeue(&self, item: &QueueItem, lease: LeaseId, at_ms: u64) -> Result<()>;

    /// Move all items of a job to a new time without holding a lease. Lease
    /// liveness is judged at `now_ms`. Used by the debouncer to slide its
    /// timeout item.
    async fn requeue_by_job_id(
        &self,
        partition: &str,
        job_id: &str,
        at_ms: u64,
        now_ms: u64,
    ) -> Result<()>;

    /// Remove an item outright (consumed pauses, cancelled work) unless a
    /// lease is live at `now_ms`.
    async fn remove(&self, partition: &str, item_id: &str, now_ms: u64) -> Result<()>;

    /// Push a partition's pointer forward, cooling it off after its leasable
    /// items were all concurrency-blocked.
    async fn backoff_partition(&self, partition: &str, until_ms: u64) -> Result<()>;

    /// Number of leases live at `now_ms` for a concurrency key. Diagnostic.
    async fn in_flight(&self, key: &str, now_ms: u64) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_id_embeds_expiry() {
        let lease = LeaseId::new(1_700_000_000_000, Duration::from_secs(20));
        assert_eq!(lease.expires_at_ms(), 1_700_000_020_000);
        assert!(!lease.is_expired(1_700_000_019_999));
        assert!(lease.is_expired(1_700_000_020_000));
    }

    #[test]
    fn test_can_retry() {
        let mut item = QueueItem {
            id: "i".into(),
            job_id: "j".into(),
            kind: ItemKind::Edge,
            function_id: Uuid::new_v4(),
            run_id: None,
            attempt: 0,
            max_attempts: 4,
            at_ms: 0,
            payload: Value::Null,
            concurrency: Vec::new(),
        };
        assert!(item.can_retry());
        item.attempt = 3;
        assert!(!item.can_retry());
    }

    #[test]
    fn test_item_kind_serde_names() {
        let json = serde_json::to_string(&ItemKind::ScheduleBatch).unwrap();
        assert_eq!(json, r#""schedule_batch""#);
        let kind: ItemKind = serde_json::from_str(r#""edge_error""#).unwrap();
        assert_eq!(kind, ItemKind::EdgeError);
    }
}
