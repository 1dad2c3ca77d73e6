// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Debouncing: collapse bursts of events into one run of the latest event.
//!
//! Each `(function, key)` pointer owns at most one pending debounce. New
//! events replace the stored payload and slide the scheduled queue item to
//! `now + period`, capped by the optional absolute timeout measured from the
//! first event. When the quiet period elapses the queue item fires and starts
//! a run with the last event seen.

mod memory;
mod redis;

pub use memory::MemoryDebounceStore;
pub use redis::RedisDebounceStore;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::event::TrackedEvent;
use crate::function::{Debounce, Function};
use crate::ids;
use crate::queue::{ItemKind, Queue, QueueItem};

/// Slack added to the scheduled time so the slide lands after the period.
pub const DEBOUNCE_BUFFER: Duration = Duration::from_millis(50);

/// Extra delay on the queue item beyond the period, absorbing clock skew
/// between the scheduler and queue workers.
const ITEM_DELAY: Duration = Duration::from_secs(1);

/// Attempts when the debounce is mid-execution or migrating.
const UPDATE_ATTEMPTS: u32 = 5;

/// Spacing between update attempts.
const UPDATE_SPACING: Duration = Duration::from_millis(750);

/// Outcome of a debounce upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upserted {
    /// A new debounce was created.
    Created {
        /// The new debounce ID.
        id: Uuid,
    },
    /// An existing debounce's payload was replaced.
    Updated {
        /// The existing debounce ID.
        id: Uuid,
        /// When the debounce was first created, for the absolute timeout cap.
        created_at_ms: u64,
    },
}

/// Durable debounce storage.
#[async_trait::async_trait]
pub trait DebounceStore: Send + Sync {
    /// Create the debounce for `(function_id, key)` or replace its payload.
    /// Fails with `DebounceInProgress` while its item executes and
    /// `DebounceMigrating` during a queue migration.
    async fn upsert(
        &self,
        function_id: Uuid,
        key: &str,
        event: &TrackedEvent,
        now_ms: u64,
    ) -> Result<Upserted>;

    /// Begin executing a debounce: flag it in-progress and return the stored
    /// payload. Fails with `DebounceNotFound` when it is gone or already
    /// started.
    async fn start(&self, id: Uuid) -> Result<TrackedEvent>;

    /// Remove a debounce and its pointer.
    async fn delete(&self, function_id: Uuid, key: &str, id: Uuid) -> Result<()>;

    /// Set or clear the migrating flag. Updates observing the flag retry
    /// from scratch.
    async fn set_migrating(&self, id: Uuid, on: bool) -> Result<()>;
}

/// Coordinates debounce storage with the queue item that fires it.
pub struct Debouncer {
    store: Arc<dyn DebounceStore>,
    queue: Arc<dyn Queue>,
}

impl Debouncer {
    /// Create a debouncer over a store and queue.
    pub fn new(store: Arc<dyn DebounceStore>, queue: Arc<dyn Queue>) -> Self {
        Self { store, queue }
    }

    /// Fold an event into the function's debounce, creating or sliding the
    /// timeout item.
    pub async fn observe(
        &self,
        function: &Function,
        config: &Debounce,
        key: &str,
        event: &TrackedEvent,
    ) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..UPDATE_ATTEMPTS {
            let now_ms = ids::now_ms();
            match self.store.upsert(function.id, key, event, now_ms).await {
                Ok(Upserted::Created { id }) => {
                    let at_ms = self.item_time(config, now_ms, now_ms);
                    let item = QueueItem {
                        id: format!("debounce:{id}"),
                        job_id: id.to_string(),
                        kind: ItemKind::Debounce,
                        function_id: function.id,
                        run_id: None,
                        attempt: 0,
                        max_attempts: 1,
                        at_ms,
                        payload: json!({ "debounce_id": id, "key": key }),
                        concurrency: Vec::new(),
                    };
                    return match self.queue.enqueue(&item).await {
                        Ok(()) | Err(EngineError::Duplicate(_)) => Ok(()),
                        Err(e) => Err(e),
                    };
                }
                Ok(Upserted::Updated { id, created_at_ms }) => {
                    let at_ms = self.item_time(config, now_ms, created_at_ms);
                    match self
                        .queue
                        .requeue_by_job_id(&function.id.to_string(), &id.to_string(), at_ms, now_ms)
                        .await
                    {
                        Ok(()) => return Ok(()),
                        // The item is executing or already consumed; retry so
                        // the event lands in a fresh debounce.
                        Err(EngineError::AlreadyLeased(_)) | Err(EngineError::NoneReady) => {
                            last_err = Some(EngineError::DebounceInProgress(id.to_string()));
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(
                    e @ (EngineError::DebounceInProgress(_) | EngineError::DebounceMigrating(_)),
                ) => {
                    tracing::debug!(attempt, error = %e, "debounce busy, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
            if attempt + 1 < UPDATE_ATTEMPTS {
                tokio::time::sleep(UPDATE_SPACING).await;
            }
        }
        Err(last_err
            .unwrap_or_else(|| EngineError::DebounceInProgress("unknown".to_string())))
    }

    /// Scheduled fire time: `now + period`, capped by the absolute timeout
    /// from creation, plus buffer and item delay.
    fn item_time(&self, config: &Debounce, now_ms: u64, created_at_ms: u64) -> u64 {
        let mut at = now_ms + config.period_secs * 1000;
        if let Some(timeout) = config.timeout_secs {
            at = at.min(created_at_ms + timeout * 1000);
        }
        at + DEBOUNCE_BUFFER.as_millis() as u64 + ITEM_DELAY.as_millis() as u64
    }

    /// Begin executing a fired debounce: returns the latest payload event.
    pub async fn start(&self, id: Uuid) -> Result<TrackedEvent> {
        self.store.start(id).await
    }

    /// Tear down a finished debounce.
    pub async fn finish(&self, function_id: Uuid, key: &str, id: Uuid) -> Result<()> {
        self.store.delete(function_id, key, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::function::Trigger;
    use crate::queue::MemoryQueue;

    fn function() -> Function {
        let app_id = Function::derive_app_id("http://localhost:3000/api/strand");
        Function {
            id: Function::derive_id(app_id, "debounced"),
            app_id,
            slug: "debounced".to_string(),
            name: String::new(),
            version: 1,
            url: "http://localhost:3000/api/strand".to_string(),
            triggers: vec![Trigger::Event { event: "doc/edited".to_string(), expression: None }],
            concurrency: Vec::new(),
            rate_limit: None,
            throttle: None,
            priority: None,
            debounce: Some(Debounce { period_secs: 10, timeout_secs: Some(60), key: None }),
            batch: None,
            cancel_on: Vec::new(),
            idempotency: None,
            max_attempts: None,
            retry_interval_secs: None,
            timeout_secs: None,
            on_failure: None,
        }
    }

    fn event(n: u64) -> TrackedEvent {
        TrackedEvent::new(Event {
            id: String::new(),
            name: "doc/edited".to_string(),
            data: serde_json::json!({"n": n}),
            user: serde_json::Value::Null,
            ts: 0,
            v: String::new(),
        })
    }

    #[tokio::test]
    async fn test_first_event_creates_item() {
        let queue = Arc::new(MemoryQueue::default());
        let store = Arc::new(MemoryDebounceStore::new());
        let debouncer = Debouncer::new(store, queue.clone());
        let f = function();
        let cfg = f.debounce.clone().unwrap();

        debouncer.observe(&f, &cfg, "", &event(1)).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_second_event_slides_not_duplicates() {
        let queue = Arc::new(MemoryQueue::default());
        let store = Arc::new(MemoryDebounceStore::new());
        let debouncer = Debouncer::new(store.clone(), queue.clone());
        let f = function();
        let cfg = f.debounce.clone().unwrap();

        debouncer.observe(&f, &cfg, "", &event(1)).await.unwrap();
        debouncer.observe(&f, &cfg, "", &event(2)).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_start_returns_latest_payload() {
        let queue = Arc::new(MemoryQueue::default());
        let store = Arc::new(MemoryDebounceStore::new());
        let debouncer = Debouncer::new(store.clone(), queue.clone());
        let f = function();
        let cfg = f.debounce.clone().unwrap();

        debouncer.observe(&f, &cfg, "", &event(1)).await.unwrap();
        debouncer.observe(&f, &cfg, "", &event(2)).await.unwrap();

        let items = queue.peek(&f.id.to_string(), u64::MAX / 2, 10).await.unwrap();
        let debounce_id: Uuid =
            serde_json::from_value(items[0].payload["debounce_id"].clone()).unwrap();

        let payload = debouncer.start(debounce_id).await.unwrap();
        assert_eq!(payload.event.data["n"], 2);

        // Once started, further events create a fresh debounce.
        let err = store.upsert(f.id, "", &event(3), ids::now_ms()).await;
        assert!(matches!(err, Err(EngineError::DebounceInProgress(_))));
    }

    #[tokio::test]
    async fn test_absolute_timeout_caps_slide() {
        let queue = Arc::new(MemoryQueue::default());
        let store = Arc::new(MemoryDebounceStore::new());
        let debouncer = Debouncer::new(store, queue);
        let cfg = Debounce { period_secs: 10, timeout_secs: Some(5), key: None };
        // Slide far past the cap: the fire time pins at created + timeout.
        let created = 1_000_000;
        let now = created + 100_000;
        let at = debouncer.item_time(&cfg, now, created);
        let expected = created
            + 5_000
            + DEBOUNCE_BUFFER.as_millis() as u64
            + ITEM_DELAY.as_millis() as u64;
        assert_eq!(at, expected);
    }
}
