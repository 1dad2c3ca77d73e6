// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory batch store for dev mode and tests.

use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::event::TrackedEvent;
use crate::ids;

use super::{Appended, BatchStore};

struct Batch {
    events: Vec<TrackedEvent>,
    started: bool,
}

#[derive(Default)]
struct Inner {
    pointers: HashMap<(Uuid, String), Uuid>,
    batches: HashMap<Uuid, Batch>,
}

/// Batch store held entirely in process memory.
#[derive(Default)]
pub struct MemoryBatchStore {
    inner: Mutex<Inner>,
}

impl MemoryBatchStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl BatchStore for MemoryBatchStore {
    async fn append(
        &self,
        function_id: Uuid,
        key: &str,
        event: &TrackedEvent,
        max_size: usize,
    ) -> Result<Appended> {
        let mut inner = self.inner.lock().unwrap();
        let pointer = (function_id, key.to_string());

        let open = inner
            .pointers
            .get(&pointer)
            .copied()
            .filter(|bid| inner.batches.get(bid).map(|b| !b.started).unwrap_or(false));

        let (batch_id, created) = match open {
            Some(bid) => (bid, false),
            None => {
                let bid = ids::new_id();
                inner.pointers.insert(pointer.clone(), bid);
                inner.batches.insert(bid, Batch { events: Vec::new(), started: false });
                (bid, true)
            }
        };

        let batch = inner.batches.get_mut(&batch_id).unwrap();
        batch.events.push(event.clone());
        let count = batch.events.len();
        let full = count >= max_size;
        if full {
            batch.started = true;
            inner.pointers.remove(&pointer);
        }
        Ok(Appended { batch_id, created, count, full })
    }

    async fn claim(&self, function_id: Uuid, key: &str, batch_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let batch = inner
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| EngineError::BatchNotFound(batch_id.to_string()))?;
        if batch.started {
            return Err(EngineError::BatchNotFound(batch_id.to_string()));
        }
        batch.started = true;
        let pointer = (function_id, key.to_string());
        if inner.pointers.get(&pointer) == Some(&batch_id) {
            inner.pointers.remove(&pointer);
        }
        Ok(())
    }

    async fn events(&self, batch_id: Uuid) -> Result<Vec<TrackedEvent>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .batches
            .get(&batch_id)
            .map(|b| b.events.clone())
            .unwrap_or_default())
    }

    async fn delete(&self, batch_id: Uuid) -> Result<()> {
        self.inner.lock().unwrap().batches.remove(&batch_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, TrackedEvent};
    use serde_json::json;

    fn event(n: u64) -> TrackedEvent {
        TrackedEvent::new(Event {
            id: String::new(),
            name: "order/created".to_string(),
            data: json!({"n": n}),
            user: serde_json::Value::Null,
            ts: 0,
            v: String::new(),
        })
    }

    #[tokio::test]
    async fn test_first_append_opens_batch() {
        let store = MemoryBatchStore::new();
        let fn_id = Uuid::new_v4();
        let a = store.append(fn_id, "", &event(1), 3).await.unwrap();
        assert!(a.created);
        assert_eq!(a.count, 1);
        assert!(!a.full);

        let b = store.append(fn_id, "", &event(2), 3).await.unwrap();
        assert!(!b.created);
        assert_eq!(b.batch_id, a.batch_id);
        assert_eq!(b.count, 2);
    }

    #[tokio::test]
    async fn test_full_append_rotates_pointer() {
        let store = MemoryBatchStore::new();
        let fn_id = Uuid::new_v4();
        let a = store.append(fn_id, "", &event(1), 2).await.unwrap();
        let b = store.append(fn_id, "", &event(2), 2).await.unwrap();
        assert!(b.full);
        assert_eq!(b.batch_id, a.batch_id);

        // Next event opens a fresh batch.
        let c = store.append(fn_id, "", &event(3), 2).await.unwrap();
        assert!(c.created);
        assert_ne!(c.batch_id, a.batch_id);

        // The full batch is already claimed; the timeout item becomes a no-op.
        let err = store.claim(fn_id, "", a.batch_id).await.unwrap_err();
        assert_eq!(err.error_code(), "BATCH_NOT_FOUND");
        assert_eq!(store.events(a.batch_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_claim_once() {
        let store = MemoryBatchStore::new();
        let fn_id = Uuid::new_v4();
        let a = store.append(fn_id, "", &event(1), 10).await.unwrap();
        store.claim(fn_id, "", a.batch_id).await.unwrap();
        assert!(store.claim(fn_id, "", a.batch_id).await.is_err());
    }

    #[tokio::test]
    async fn test_keys_batch_independently() {
        let store = MemoryBatchStore::new();
        let fn_id = Uuid::new_v4();
        let a = store.append(fn_id, "cust-1", &event(1), 10).await.unwrap();
        let b = store.append(fn_id, "cust-2", &event(2), 10).await.unwrap();
        assert_ne!(a.batch_id, b.batch_id);
        assert!(a.created && b.created);
    }
}
