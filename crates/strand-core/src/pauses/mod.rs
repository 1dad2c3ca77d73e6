// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pauses: runs waiting on events, invocations or signals.
//!
//! A pause freezes a run at one step until a matching event arrives, an
//! invoked child run finishes, a signal is delivered, or the timeout fires.
//! Resumption is a two-phase Lease then Consume: many matchers may race for
//! one pause, exactly one wins the lease and consumes it, and a consumed
//! pause stays consumable-never-again even if the winner crashes before
//! enqueuing the resume (the timeout item notices and resumes from the stored
//! resume data).

mod memory;
mod redis;

pub use memory::MemoryPauseStore;
pub use redis::RedisPauseStore;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::state::RunIdentifier;

/// How long a pause lease is held between Lease and Consume.
pub const PAUSE_LEASE: Duration = Duration::from_secs(5);

/// A paused step waiting for resumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pause {
    /// Unique pause ID.
    pub id: Uuid,
    /// The paused run.
    pub identifier: RunIdentifier,
    /// The step that paused; its output becomes the resume data.
    pub step_id: String,
    /// Event name the pause waits for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Match expression over `{"event": trigger, "async": candidate}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Invoke correlation ID the pause waits for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Signal name the pause waits for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    /// Millisecond timestamp at which the timeout item fires.
    pub expires_at_ms: u64,
    /// Queue item ID of the timeout item, removed on early resume.
    pub timeout_item_id: String,
    /// When set, consuming this pause cancels the run instead of resuming a
    /// step. Used for `cancel_on` triggers.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancel: bool,
}

/// Result of consuming a pause.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedPause {
    /// The pause that was consumed.
    pub pause: Pause,
    /// Data the resumed step returns (matched event, invoke result, signal
    /// payload, or null on timeout).
    pub resume_data: Value,
}

/// Durable pause storage and indexes.
#[async_trait::async_trait]
pub trait PauseStore: Send + Sync {
    /// Persist a pause and register it in its indexes.
    async fn save(&self, pause: &Pause) -> Result<()>;

    /// Load a pause by ID, consumed or not.
    async fn load(&self, pause_id: Uuid) -> Result<Pause>;

    /// Resume data of a consumed pause, `None` while unconsumed.
    async fn resume_data(&self, pause_id: Uuid) -> Result<Option<Value>>;

    /// Unconsumed pauses waiting on an event name.
    async fn pauses_by_event(&self, event_name: &str) -> Result<Vec<Pause>>;

    /// The pause registered for an invoke correlation ID.
    async fn pause_by_correlation(&self, correlation_id: &str) -> Result<Option<Pause>>;

    /// The pause registered for a signal name.
    async fn pause_by_signal(&self, signal: &str) -> Result<Option<Pause>>;

    /// First phase of resumption: take the exclusive lease.
    async fn lease(&self, pause_id: Uuid, now_ms: u64) -> Result<()>;

    /// Second phase: mark consumed, store the resume data and clear indexes.
    async fn consume(&self, pause_id: Uuid, resume_data: &Value) -> Result<()>;

    /// Delete a pause after its resume was enqueued (or on run teardown).
    async fn delete(&self, pause_id: Uuid) -> Result<()>;

    /// Delete every pause belonging to a run. Returns the removed pauses so
    /// the caller can drop their timeout queue items. Called on every
    /// terminal transition; without it `cancel_on` pauses would linger for
    /// their full TTL.
    async fn delete_by_run(&self, run_id: Uuid) -> Result<Vec<Pause>>;
}
