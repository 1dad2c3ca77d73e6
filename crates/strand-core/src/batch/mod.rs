// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event batching.
//!
//! Functions with a batch config accumulate events into a shared batch
//! instead of starting one run per event. A batch flushes when it reaches
//! `max_size` or when its timeout elapses, whichever comes first; flushing
//! rotates the pointer so the next event opens a fresh batch. A batch is
//! claimed exactly once, so the full-flush path and the timeout item never
//! both start a run.

mod buffer;
mod memory;
mod redis;

pub use buffer::BatchBuffer;
pub use memory::MemoryBatchStore;
pub use redis::RedisBatchStore;

use uuid::Uuid;

use crate::error::Result;
use crate::event::TrackedEvent;

/// Outcome of appending one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appended {
    /// The batch the event landed in.
    pub batch_id: Uuid,
    /// Whether this append opened the batch (caller schedules the timeout).
    pub created: bool,
    /// Events in the batch after this append.
    pub count: usize,
    /// Whether the append filled the batch (caller flushes now).
    pub full: bool,
}

/// Durable batch storage.
#[async_trait::async_trait]
pub trait BatchStore: Send + Sync {
    /// Append an event to the open batch for `(function_id, key)`, opening a
    /// new batch when none is open. When the append fills the batch it is
    /// atomically claimed and the pointer cleared.
    async fn append(
        &self,
        function_id: Uuid,
        key: &str,
        event: &TrackedEvent,
        max_size: usize,
    ) -> Result<Appended>;

    /// Append several events in order with one store round trip. An event
    /// that fills the batch rotates the pointer mid-bulk; the leftovers open
    /// a fresh batch, all reported per event. The default loops over
    /// [`BatchStore::append`]; backends override it with an atomic script.
    async fn append_bulk(
        &self,
        function_id: Uuid,
        key: &str,
        events: &[TrackedEvent],
        max_size: usize,
    ) -> Result<Vec<Appended>> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            out.push(self.append(function_id, key, event, max_size).await?);
        }
        Ok(out)
    }

    /// Claim a batch for flushing. Fails with `BatchNotFound` when the batch
    /// is gone or was already claimed.
    async fn claim(&self, function_id: Uuid, key: &str, batch_id: Uuid) -> Result<()>;

    /// Events of a batch in append order.
    async fn events(&self, batch_id: Uuid) -> Result<Vec<TrackedEvent>>;

    /// Delete a batch after its run was scheduled.
    async fn delete(&self, batch_id: Uuid) -> Result<()>;
}
