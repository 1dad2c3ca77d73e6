// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory queue for dev mode and tests.
//!
//! Mirrors the Redis queue's semantics exactly (lease matching, concurrency
//! gates, partition pointers) over a single mutex-guarded structure.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::ids;

use super::{
    ConcurrencyLimitGetter, ENQUEUE_IDEMPOTENCY_TTL, FrozenLimits, LeaseId, Partition, Queue,
    QueueItem,
};

#[derive(Default)]
struct Inner {
    /// Item blobs by ID.
    items: HashMap<String, QueueItem>,
    /// Live leases: item ID to lease.
    leases: HashMap<String, LeaseId>,
    /// Job ID to member item IDs.
    jobs: HashMap<String, Vec<String>>,
    /// Concurrency key to in-flight item IDs with lease expiry.
    concurrency: HashMap<String, HashMap<String, u64>>,
    /// Partition pointer overrides from cool-off.
    backoff: HashMap<String, u64>,
    /// Item ID to idempotency-record expiry. Kept on wall-clock time since
    /// enqueue carries no caller time.
    idempotency: HashMap<String, u64>,
}

impl Inner {
    fn prune_gate(&mut self, key: &str, now_ms: u64) {
        if let Some(slots) = self.concurrency.get_mut(key) {
            slots.retain(|_, expiry| *expiry > now_ms);
        }
    }

    fn release_gates(&mut self, item: &QueueItem) {
        for gate in &item.concurrency {
            if let Some(slots) = self.concurrency.get_mut(&gate.key) {
                slots.remove(&item.id);
            }
        }
    }

    fn drop_job_member(&mut self, job_id: &str, item_id: &str) {
        if let Some(members) = self.jobs.get_mut(job_id) {
            members.retain(|m| m != item_id);
            if members.is_empty() {
                self.jobs.remove(job_id);
            }
        }
    }
}

/// Queue held entirely in process memory.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    limits: Arc<dyn ConcurrencyLimitGetter>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Arc::new(FrozenLimits))
    }
}

impl MemoryQueue {
    /// A memory queue with the given limit getter.
    pub fn new(limits: Arc<dyn ConcurrencyLimitGetter>) -> Self {
        Self { inner: Mutex::new(Inner::default()), limits }
    }

    /// Number of stored items. Diagnostic.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, item: &QueueItem) -> Result<()> {
        let now_ms = ids::now_ms();
        let mut inner = self.inner.lock().unwrap();
        inner.idempotency.retain(|_, expiry| *expiry > now_ms);
        if inner.items.contains_key(&item.id) || inner.idempotency.contains_key(&item.id) {
            return Err(EngineError::Duplicate(item.id.clone()));
        }
        inner
            .idempotency
            .insert(item.id.clone(), now_ms + ENQUEUE_IDEMPOTENCY_TTL.as_millis() as u64);
        inner.jobs.entry(item.job_id.clone()).or_default().push(item.id.clone());
        inner.items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn peek_partitions(&self, now_ms: u64, limit: usize) -> Result<Vec<Partition>> {
        let inner = self.inner.lock().unwrap();
        let mut earliest: HashMap<String, u64> = HashMap::new();
        for item in inner.items.values() {
            let partition = item.partition();
            earliest
                .entry(partition)
                .and_modify(|e| *e = (*e).min(item.at_ms))
                .or_insert(item.at_ms);
        }
        let mut out: Vec<Partition> = earliest
            .into_iter()
            .map(|(key, mut at)| {
                if let Some(backoff) = inner.backoff.get(&key) {
                    at = at.max(*backoff);
                }
                Partition { key, earliest_ms: at }
            })
            .filter(|p| p.earliest_ms <= now_ms)
            .collect();
        out.sort_by_key(|p| p.earliest_ms);
        out.truncate(limit);
        Ok(out)
    }

    async fn peek(&self, partition: &str, now_ms: u64, limit: usize) -> Result<Vec<QueueItem>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<QueueItem> = inner
            .items
            .values()
            .filter(|item| item.partition() == partition && item.at_ms <= now_ms)
            .filter(|item| {
                inner.leases.get(&item.id).map(|l| l.is_expired(now_ms)).unwrap_or(true)
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.at_ms.cmp(&b.at_ms).then_with(|| a.id.cmp(&b.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn lease(&self, item_id: &str, duration: Duration, now_ms: u64) -> Result<LeaseId> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.items.get(item_id).cloned().ok_or(EngineError::NoneReady)?;
        if let Some(held) = inner.leases.get(item_id) {
            if !held.is_expired(now_ms) {
                return Err(EngineError::AlreadyLeased(item_id.to_string()));
            }
        }
        for gate in &item.concurrency {
            inner.prune_gate(&gate.key, now_ms);
            let limit =
                self.limits.limit_for(item.function_id, gate).unwrap_or(gate.limit) as usize;
            let used = inner.concurrency.get(&gate.key).map(|s| s.len()).unwrap_or(0);
            if used >= limit {
                return Err(EngineError::ConcurrencyLimited(gate.key.clone()));
            }
        }
        let lease = LeaseId::new(now_ms, duration);
        for gate in &item.concurrency {
            inner
                .concurrency
                .entry(gate.key.clone())
                .or_default()
                .insert(item_id.to_string(), lease.expires_at_ms());
        }
        inner.leases.insert(item_id.to_string(), lease);
        Ok(lease)
    }

    async fn extend_lease(
        &self,
        item_id: &str,
        lease: LeaseId,
        duration: Duration,
        now_ms: u64,
    ) -> Result<LeaseId> {
        let mut inner = self.inner.lock().unwrap();
        match inner.leases.get(item_id) {
            Some(held) if *held == lease && !held.is_expired(now_ms) => {}
            _ => return Err(EngineError::LeaseLost(item_id.to_string())),
        }
        let next = LeaseId::new(now_ms, duration);
        let gates: Vec<String> = inner
            .items
            .get(item_id)
            .map(|i| i.concurrency.iter().map(|g| g.key.clone()).collect())
            .unwrap_or_default();
        for key in gates {
            if let Some(slots) = inner.concurrency.get_mut(&key) {
                if let Some(expiry) = slots.get_mut(item_id) {
                    *expiry = next.expires_at_ms();
                }
            }
        }
        inner.leases.insert(item_id.to_string(), next);
        Ok(next)
    }

    async fn dequeue(&self, item_id: &str, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.leases.get(item_id) {
            Some(held) if *held == lease => {}
            _ => return Err(EngineError::LeaseLost(item_id.to_string())),
        }
        inner.leases.remove(item_id);
        if let Some(item) = inner.items.remove(item_id) {
            inner.release_gates(&item);
            inner.drop_job_member(&item.job_id.clone(), item_id);
        }
        Ok(())
    }

    async fn requeue(&self, item: &QueueItem, lease: LeaseId, at_ms: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.leases.get(&item.id) {
            Some(held) if *held == lease => {}
            _ => return Err(EngineError::LeaseLost(item.id.clone())),
        }
        inner.leases.remove(&item.id);
        inner.release_gates(item);
        let mut updated = item.clone();
        updated.at_ms = at_ms;
        inner.items.insert(item.id.clone(), updated);
        Ok(())
    }

    async fn requeue_by_job_id(
        &self,
        _partition: &str,
        job_id: &str,
        at_ms: u64,
        now_ms: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let members = inner.jobs.get(job_id).cloned().ok_or(EngineError::NoneReady)?;
        for id in &members {
            if let Some(held) = inner.leases.get(id) {
                if !held.is_expired(now_ms) {
                    return Err(EngineError::AlreadyLeased(job_id.to_string()));
                }
            }
        }
        for id in &members {
            inner.leases.remove(id);
            if let Some(item) = inner.items.get_mut(id) {
                item.at_ms = at_ms;
            }
        }
        Ok(())
    }

    async fn remove(&self, _partition: &str, item_id: &str, now_ms: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(held) = inner.leases.get(item_id) {
            if !held.is_expired(now_ms) {
                return Err(EngineError::AlreadyLeased(item_id.to_string()));
            }
        }
        inner.leases.remove(item_id);
        if let Some(item) = inner.items.remove(item_id) {
            inner.release_gates(&item);
            inner.drop_job_member(&item.job_id.clone(), item_id);
        }
        Ok(())
    }

    async fn backoff_partition(&self, partition: &str, until_ms: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.backoff.entry(partition.to_string()).or_insert(0);
        *entry = (*entry).max(until_ms);
        Ok(())
    }

    async fn in_flight(&self, key: &str, now_ms: u64) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .concurrency
            .get(key)
            .map(|slots| slots.values().filter(|expiry| **expiry > now_ms).count() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{ConcurrencyKey, ItemKind};
    use super::*;
    use crate::function::ConcurrencyScope;
    use serde_json::Value;
    use uuid::Uuid;

    fn item(id: &str, fn_id: Uuid, at_ms: u64) -> QueueItem {
        QueueItem {
            id: id.to_string(),
            job_id: format!("job-{id}"),
            kind: ItemKind::Edge,
            function_id: fn_id,
            run_id: None,
            attempt: 0,
            max_attempts: 4,
            at_ms,
            payload: Value::Null,
            concurrency: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_dedupes_on_id() {
        let q = MemoryQueue::default();
        let fn_id = Uuid::new_v4();
        q.enqueue(&item("a", fn_id, 100)).await.unwrap();
        let err = q.enqueue(&item("a", fn_id, 200)).await.unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE");
    }

    #[tokio::test]
    async fn test_enqueue_idempotency_outlives_dequeue() {
        let q = MemoryQueue::default();
        let fn_id = Uuid::new_v4();
        q.enqueue(&item("a", fn_id, 100)).await.unwrap();
        let lease = q.lease("a", Duration::from_secs(10), 1_000).await.unwrap();
        q.dequeue("a", lease).await.unwrap();
        assert!(q.is_empty());

        // The ID stays deduplicated after the item itself is gone.
        let err = q.enqueue(&item("a", fn_id, 200)).await.unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE");
    }

    #[tokio::test]
    async fn test_peek_orders_by_time_and_hides_future() {
        let q = MemoryQueue::default();
        let fn_id = Uuid::new_v4();
        q.enqueue(&item("late", fn_id, 300)).await.unwrap();
        q.enqueue(&item("early", fn_id, 100)).await.unwrap();
        q.enqueue(&item("future", fn_id, 9_000)).await.unwrap();

        let ready = q.peek(&fn_id.to_string(), 500, 10).await.unwrap();
        let ids: Vec<&str> = ready.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn test_lease_excludes_from_peek_until_expiry() {
        let q = MemoryQueue::default();
        let fn_id = Uuid::new_v4();
        q.enqueue(&item("a", fn_id, 100)).await.unwrap();

        let lease = q.lease("a", Duration::from_secs(10), 1_000).await.unwrap();
        assert!(q.peek(&fn_id.to_string(), 1_000, 10).await.unwrap().is_empty());
        // A second worker cannot steal the lease.
        let err = q.lease("a", Duration::from_secs(10), 1_000).await.unwrap_err();
        assert_eq!(err.error_code(), "ALREADY_LEASED");
        // After expiry the item is visible and leasable again.
        let later = lease.expires_at_ms() + 1;
        assert_eq!(q.peek(&fn_id.to_string(), later, 10).await.unwrap().len(), 1);
        q.lease("a", Duration::from_secs(10), later).await.unwrap();
    }

    #[tokio::test]
    async fn test_dequeue_requires_matching_lease() {
        let q = MemoryQueue::default();
        let fn_id = Uuid::new_v4();
        q.enqueue(&item("a", fn_id, 100)).await.unwrap();
        let lease = q.lease("a", Duration::from_secs(10), 1_000).await.unwrap();

        let stale = LeaseId::new(1_000, Duration::from_secs(10));
        assert!(q.dequeue("a", stale).await.is_err());
        q.dequeue("a", lease).await.unwrap();
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_concurrency_gate_blocks_second_lease() {
        let q = MemoryQueue::default();
        let fn_id = Uuid::new_v4();
        let gate = ConcurrencyKey {
            scope: ConcurrencyScope::Function,
            key: format!("f:{fn_id}"),
            expression_hash: String::new(),
            limit: 1,
        };
        let mut a = item("a", fn_id, 100);
        a.concurrency = vec![gate.clone()];
        let mut b = item("b", fn_id, 100);
        b.concurrency = vec![gate.clone()];
        q.enqueue(&a).await.unwrap();
        q.enqueue(&b).await.unwrap();

        let lease = q.lease("a", Duration::from_secs(10), 1_000).await.unwrap();
        let err = q.lease("b", Duration::from_secs(10), 1_000).await.unwrap_err();
        assert_eq!(err.error_code(), "CONCURRENCY_LIMITED");
        assert_eq!(q.in_flight(&gate.key, 1_000).await.unwrap(), 1);
        // The slot frees once the lease expires at the caller's clock.
        assert_eq!(q.in_flight(&gate.key, 20_000).await.unwrap(), 0);

        q.dequeue("a", lease).await.unwrap();
        q.lease("b", Duration::from_secs(10), 1_001).await.unwrap();
    }

    #[tokio::test]
    async fn test_requeue_reschedules_and_releases() {
        let q = MemoryQueue::default();
        let fn_id = Uuid::new_v4();
        let mut a = item("a", fn_id, 100);
        a.concurrency = vec![ConcurrencyKey {
            scope: ConcurrencyScope::Function,
            key: format!("f:{fn_id}"),
            expression_hash: String::new(),
            limit: 1,
        }];
        q.enqueue(&a).await.unwrap();
        let lease = q.lease("a", Duration::from_secs(10), 1_000).await.unwrap();

        let mut retry = a.clone();
        retry.attempt = 1;
        q.requeue(&retry, lease, 5_000).await.unwrap();
        assert_eq!(q.in_flight(&a.concurrency[0].key, 1_000).await.unwrap(), 0);

        let ready = q.peek(&fn_id.to_string(), 5_000, 10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_requeue_by_job_id_slides_items() {
        let q = MemoryQueue::default();
        let fn_id = Uuid::new_v4();
        let mut a = item("a", fn_id, 100);
        a.job_id = "shared".to_string();
        q.enqueue(&a).await.unwrap();

        q.requeue_by_job_id(&fn_id.to_string(), "shared", 9_999, 500).await.unwrap();
        assert!(q.peek(&fn_id.to_string(), 1_000, 10).await.unwrap().is_empty());
        assert_eq!(q.peek(&fn_id.to_string(), 9_999, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_requeue_by_job_id_respects_live_lease() {
        let q = MemoryQueue::default();
        let fn_id = Uuid::new_v4();
        let mut a = item("a", fn_id, 100);
        a.job_id = "shared".to_string();
        q.enqueue(&a).await.unwrap();
        q.lease("a", Duration::from_secs(10), 1_000).await.unwrap();

        // Judged at the caller's clock, not the wall clock.
        let err = q.requeue_by_job_id(&fn_id.to_string(), "shared", 9_999, 1_000).await.unwrap_err();
        assert_eq!(err.error_code(), "ALREADY_LEASED");
        q.requeue_by_job_id(&fn_id.to_string(), "shared", 9_999, 20_000).await.unwrap();
    }

    #[tokio::test]
    async fn test_partition_backoff_is_monotone() {
        let q = MemoryQueue::default();
        let fn_id = Uuid::new_v4();
        q.enqueue(&item("a", fn_id, 100)).await.unwrap();

        q.backoff_partition(&fn_id.to_string(), 5_000).await.unwrap();
        q.backoff_partition(&fn_id.to_string(), 2_000).await.unwrap();

        assert!(q.peek_partitions(4_999, 10).await.unwrap().is_empty());
        assert_eq!(q.peek_partitions(5_000, 10).await.unwrap().len(), 1);
    }
}
