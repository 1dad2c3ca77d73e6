// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle listeners.
//!
//! The executor notifies listeners of run transitions. Listener failures are
//! never allowed to affect execution, so the hooks are infallible and any
//! internal errors must be swallowed (and logged) by the implementation.

use serde_json::Value;
use uuid::Uuid;

use crate::state::RunIdentifier;

/// Hooks invoked on run transitions. All methods default to no-ops so
/// listeners only implement what they care about.
#[async_trait::async_trait]
pub trait LifecycleListener: Send + Sync {
    /// A run was scheduled (its Start item was enqueued).
    async fn on_run_scheduled(&self, _id: &RunIdentifier) {}

    /// A run began executing its first step.
    async fn on_run_started(&self, _id: &RunIdentifier) {}

    /// A step finished and its output was recorded.
    async fn on_step_finished(&self, _id: &RunIdentifier, _step_id: &str) {}

    /// A step errored; a retry may follow.
    async fn on_step_errored(&self, _id: &RunIdentifier, _step_id: &str, _attempt: u32) {}

    /// The run is waiting on a pause (sleep, event, invoke or signal).
    async fn on_run_paused(&self, _id: &RunIdentifier, _pause_id: Uuid) {}

    /// A pause was resumed with data.
    async fn on_run_resumed(&self, _id: &RunIdentifier, _pause_id: Uuid) {}

    /// The run completed successfully.
    async fn on_run_finished(&self, _id: &RunIdentifier, _output: &Value) {}

    /// The run failed terminally.
    async fn on_run_failed(&self, _id: &RunIdentifier, _error: &Value) {}

    /// The run was cancelled.
    async fn on_run_cancelled(&self, _id: &RunIdentifier) {}
}

/// A listener that does nothing. Useful as a default and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

#[async_trait::async_trait]
impl LifecycleListener for NoopListener {}
