// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process append coalescing for high-frequency batch ingest.
//!
//! An optional layer in front of a [`BatchStore`]: appends for one
//! `(function, key)` gather in a local flight for a short linger, deduped by
//! internal event ID, then land in a single `append_bulk` call. Callers block
//! until the store commits, so event ingestion never acks ahead of
//! durability. The engine is correct with this layer absent; it only trades
//! round trips for a small added latency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::event::TrackedEvent;

use super::{Appended, BatchStore};

/// How long the first event of a flight waits for company.
pub const DEFAULT_LINGER: Duration = Duration::from_millis(50);

/// Flight size that flushes without waiting out the linger.
pub const DEFAULT_FLIGHT_SIZE: usize = 100;

/// Events gathered for one pointer, not yet committed.
struct Flight {
    epoch: u64,
    max_size: usize,
    events: Vec<TrackedEvent>,
    /// Waiter and the index of its event; duplicates share an index.
    waiters: Vec<(usize, oneshot::Sender<Result<Appended>>)>,
}

type Pointer = (Uuid, String);

/// Coalescing wrapper around a batch store.
pub struct BatchBuffer {
    inner: Arc<dyn BatchStore>,
    linger: Duration,
    flight_size: usize,
    epoch: AtomicU64,
    flights: Arc<Mutex<HashMap<Pointer, Flight>>>,
}

impl BatchBuffer {
    /// Wrap a store with the default linger and flight size.
    pub fn new(inner: Arc<dyn BatchStore>) -> Self {
        Self::with(inner, DEFAULT_LINGER, DEFAULT_FLIGHT_SIZE)
    }

    /// Wrap a store with explicit coalescing bounds.
    pub fn with(inner: Arc<dyn BatchStore>, linger: Duration, flight_size: usize) -> Self {
        Self {
            inner,
            linger,
            flight_size: flight_size.max(1),
            epoch: AtomicU64::new(0),
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Flush a flight after the linger, unless a size flush already took it.
    /// The epoch distinguishes this flight from a successor on the same
    /// pointer.
    fn arm_timer(&self, pointer: Pointer, epoch: u64) {
        let flights = Arc::clone(&self.flights);
        let inner = Arc::clone(&self.inner);
        let linger = self.linger;
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            let due = {
                let mut map = flights.lock().unwrap();
                match map.get(&pointer) {
                    Some(f) if f.epoch == epoch => map.remove(&pointer),
                    _ => None,
                }
            };
            if let Some(flight) = due {
                Self::flush(inner, pointer.0, &pointer.1, flight).await;
            }
        });
    }

    /// Commit a flight and settle its waiters.
    async fn flush(inner: Arc<dyn BatchStore>, function_id: Uuid, key: &str, flight: Flight) {
        match inner.append_bulk(function_id, key, &flight.events, flight.max_size).await {
            Ok(results) => {
                for (idx, tx) in flight.waiters {
                    let reply =
                        results.get(idx).cloned().ok_or_else(|| EngineError::ScriptError {
                            script: "batch_append_bulk".to_string(),
                            message: format!("no result for event at index {idx}"),
                        });
                    let _ = tx.send(reply);
                }
            }
            Err(e) => {
                // The store error is not clonable; every waiter gets one of
                // matching taxonomy so transient failures still retry.
                let transient = e.is_transient();
                let message = e.to_string();
                for (_, tx) in flight.waiters {
                    let err = if transient {
                        EngineError::KvUnavailable(message.clone())
                    } else {
                        EngineError::ScriptError {
                            script: "batch_append_bulk".to_string(),
                            message: message.clone(),
                        }
                    };
                    let _ = tx.send(Err(err));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl BatchStore for BatchBuffer {
    async fn append(
        &self,
        function_id: Uuid,
        key: &str,
        event: &TrackedEvent,
        max_size: usize,
    ) -> Result<Appended> {
        let pointer = (function_id, key.to_string());
        let (tx, rx) = oneshot::channel();
        let mut opened = None;
        let mut full_flight = None;
        {
            let mut map = self.flights.lock().unwrap();
            let flight = map.entry(pointer.clone()).or_insert_with(|| {
                let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
                opened = Some(epoch);
                Flight { epoch, max_size, events: Vec::new(), waiters: Vec::new() }
            });
            let idx = match flight
                .events
                .iter()
                .position(|e| e.internal_id == event.internal_id)
            {
                // A locally duplicated event shares the original's result.
                Some(i) => i,
                None => {
                    flight.events.push(event.clone());
                    flight.events.len() - 1
                }
            };
            flight.waiters.push((idx, tx));
            if flight.events.len() >= self.flight_size {
                full_flight = map.remove(&pointer);
            }
        }

        if let Some(flight) = full_flight {
            Self::flush(Arc::clone(&self.inner), pointer.0, &pointer.1, flight).await;
        } else if let Some(epoch) = opened {
            self.arm_timer(pointer, epoch);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::KvUnavailable("batch flight dropped".to_string())),
        }
    }

    async fn append_bulk(
        &self,
        function_id: Uuid,
        key: &str,
        events: &[TrackedEvent],
        max_size: usize,
    ) -> Result<Vec<Appended>> {
        // Already a bulk; no point staging it locally.
        self.inner.append_bulk(function_id, key, events, max_size).await
    }

    async fn claim(&self, function_id: Uuid, key: &str, batch_id: Uuid) -> Result<()> {
        self.inner.claim(function_id, key, batch_id).await
    }

    async fn events(&self, batch_id: Uuid) -> Result<Vec<TrackedEvent>> {
        self.inner.events(batch_id).await
    }

    async fn delete(&self, batch_id: Uuid) -> Result<()> {
        self.inner.delete(batch_id).await
    }
}
