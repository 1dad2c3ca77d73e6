// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run state: metadata, memoized step outputs and the replay stack.
//!
//! A run's state is append-only while it executes: each finished step writes
//! its output exactly once (duplicate writes are rejected and treated as
//! idempotent no-ops by callers), and the stack records step order for replay.
//! The SDK receives the full stack and step map on every dispatch and uses
//! them to skip already-finished steps.

mod memory;
mod redis;

pub use memory::MemoryStateStore;
pub use redis::RedisStateStore;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::event::TrackedEvent;

/// How long a finalized run's state is retained for inspection before the
/// store drops it.
pub const RUN_RETENTION: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// Terminal and in-flight run statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Scheduled but not yet dispatched.
    Scheduled,
    /// At least one dispatch happened.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed terminally (retries exhausted or fatal error).
    Failed,
    /// Cancelled by an event or API call.
    Cancelled,
    /// Killed because the run's state hit a step or size limit.
    Overflowed,
    /// Dropped by a scheduling gate (e.g. rate limit) before any dispatch.
    Skipped,
}

impl RunStatus {
    /// Whether the run can still make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Overflowed | Self::Skipped
        )
    }
}

/// Identifies one run of one function version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentifier {
    /// Time-ordered run ID.
    pub run_id: Uuid,
    /// The function being run.
    pub function_id: Uuid,
    /// Function version frozen at schedule time.
    pub function_version: i32,
}

/// Mutable metadata for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Identity of the run.
    pub identifier: RunIdentifier,
    /// Current status.
    pub status: RunStatus,
    /// Internal IDs of the triggering events.
    pub event_ids: Vec<Uuid>,
    /// Millisecond timestamp of the first dispatch, once running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    /// Millisecond timestamp of the terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
    /// SDK wire-format version negotiated on the first response.
    #[serde(default)]
    pub request_version: i32,
    /// Invoke correlation ID when this run was started by `Invoke`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl RunMetadata {
    /// Fresh metadata for a newly scheduled run.
    pub fn new(identifier: RunIdentifier, event_ids: Vec<Uuid>) -> Self {
        Self {
            identifier,
            status: RunStatus::Scheduled,
            event_ids,
            started_at_ms: None,
            ended_at_ms: None,
            request_version: -1,
            correlation_id: None,
        }
    }
}

/// Limits enforced by [`StateStore::save_step`].
#[derive(Debug, Clone, Copy)]
pub struct StateLimits {
    /// Maximum memoized steps per run.
    pub max_steps: usize,
    /// Maximum cumulative step output bytes per run.
    pub max_bytes: usize,
}

impl Default for StateLimits {
    fn default() -> Self {
        Self { max_steps: 1000, max_bytes: 64 * 1024 * 1024 }
    }
}

/// Durable run state.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Create a run with its triggering events. When `idempotency_key` is
    /// given and was seen before, fails with `RunExists`.
    async fn create_run(
        &self,
        metadata: &RunMetadata,
        events: &[TrackedEvent],
        idempotency_key: Option<&str>,
    ) -> Result<()>;

    /// Load a run's metadata.
    async fn load_run(&self, run_id: Uuid) -> Result<RunMetadata>;

    /// Load a run's triggering events.
    async fn load_events(&self, run_id: Uuid) -> Result<Vec<TrackedEvent>>;

    /// Write a step output exactly once. Fails with `StepAlreadyExists` on a
    /// duplicate, `StepLimitExceeded` or `StateSizeLimitExceeded` when a
    /// limit is hit.
    async fn save_step(&self, run_id: Uuid, step_id: &str, output: &Value) -> Result<()>;

    /// All memoized step outputs keyed by step ID.
    async fn steps(&self, run_id: Uuid) -> Result<HashMap<String, Value>>;

    /// Step IDs in completion order.
    async fn stack(&self, run_id: Uuid) -> Result<Vec<String>>;

    /// Update the run status, stamping `started_at`/`ended_at` as appropriate.
    async fn set_status(&self, run_id: Uuid, status: RunStatus, now_ms: u64) -> Result<()>;

    /// Set a terminal status and schedule deletion of all run state once
    /// [`RUN_RETENTION`] has elapsed. A no-op when the run is already
    /// terminal.
    async fn finalize(&self, run_id: Uuid, status: RunStatus, now_ms: u64) -> Result<()>;

    /// Record the SDK wire-format version negotiated for this run.
    async fn set_request_version(&self, run_id: Uuid, version: i32) -> Result<()>;

    /// Delete all state for a run immediately.
    async fn delete_run(&self, run_id: Uuid) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Scheduled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Overflowed.is_terminal());
        assert!(RunStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_new_metadata_defaults() {
        let id = RunIdentifier {
            run_id: Uuid::now_v7(),
            function_id: Uuid::new_v4(),
            function_version: 3,
        };
        let meta = RunMetadata::new(id, vec![]);
        assert_eq!(meta.status, RunStatus::Scheduled);
        assert_eq!(meta.request_version, -1);
        assert!(meta.started_at_ms.is_none());
    }
}
