// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function definitions.
//!
//! A [`Function`] is an immutable, versioned configuration registered by an
//! SDK: triggers, the endpoint URL to dispatch steps to, and scheduling
//! behavior (concurrency, rate limits, batching, debouncing, retries).
//! Identity is deterministic: the app ID is a UUIDv5 of the app URL, and the
//! function ID is a UUIDv5 of `app_id + slug`, so re-registration from any
//! process derives the same IDs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use uuid::Uuid;

/// Default maximum attempts for a step (1 initial + 3 retries).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Namespace for deterministic ID derivation.
pub const ID_NAMESPACE: Uuid = Uuid::NAMESPACE_OID;

/// How a function is triggered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Trigger {
    /// Run when a matching event arrives.
    Event {
        /// Event name to match.
        event: String,
        /// Optional expression evaluated against `{"event": ...}`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expression: Option<String>,
    },
    /// Run on a cron schedule.
    Cron {
        /// Cron pattern, e.g. `*/5 * * * *`.
        cron: String,
    },
}

/// Scope of a concurrency limit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyScope {
    /// Limit applies to all runs of the function.
    #[default]
    Function,
    /// Limit applies account-wide.
    Account,
}

/// A single concurrency limit, optionally keyed by an expression over the
/// triggering event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Concurrency {
    /// Maximum concurrently-leased items within the scope.
    pub limit: u32,
    /// Scope the limit applies to.
    #[serde(default)]
    pub scope: ConcurrencyScope,
    /// Optional key expression; each distinct evaluated key gets its own
    /// token bucket. The expression hash stays attached to queue items even
    /// if the function config later changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Run-creation rate limit: at most `limit` runs per `period` per key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimit {
    /// Maximum run creations within the window.
    pub limit: u32,
    /// Window length in seconds.
    pub period_secs: u64,
    /// Optional key expression over the triggering event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Lease-time throttle: at most `limit` leases per `period` per key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Throttle {
    /// Maximum leases within the window.
    pub limit: u32,
    /// Window length in seconds.
    pub period_secs: u64,
    /// Optional key expression over the run's identifying event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Priority configuration: shifts the effective schedule time of new runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Priority {
    /// Expression producing a signed factor in seconds; positive factors
    /// schedule earlier. Clamped to [`Priority::MAX_FACTOR_SECS`].
    pub run: String,
}

impl Priority {
    /// Maximum absolute shift, in seconds.
    pub const MAX_FACTOR_SECS: i64 = 600;
}

/// Debounce configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Debounce {
    /// Quiet period that must elapse after the last event.
    pub period_secs: u64,
    /// Optional cap on the debounce's total lifetime from the first event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Optional key expression; each evaluated key debounces independently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Batch configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    /// Flush as soon as this many events have been appended.
    pub max_size: usize,
    /// Flush this long after the first event even if not full.
    pub timeout_secs: u64,
    /// Optional key expression; each evaluated key batches independently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Cancellation trigger: cancel in-flight runs when a matching event arrives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelOn {
    /// Event name that triggers cancellation.
    pub event: String,
    /// Optional expression matched against `{"event": trigger, "async": cancel}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_expression: Option<String>,
}

/// An immutable, versioned function definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Function {
    /// Deterministic function ID (UUIDv5 of app ID + slug).
    pub id: Uuid,
    /// App this function belongs to.
    pub app_id: Uuid,
    /// Stable human-readable identifier, unique within the app.
    pub slug: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Monotonically increasing version, bumped when the config hash changes.
    pub version: i32,
    /// Endpoint the executor dispatches step requests to.
    pub url: String,
    /// Triggers; at least one.
    pub triggers: Vec<Trigger>,
    /// Concurrency limits (function/account/custom-key scopes).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concurrency: Vec<Concurrency>,
    /// Run-creation rate limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
    /// Lease-time throttle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<Throttle>,
    /// Priority factor expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Debounce configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce: Option<Debounce>,
    /// Batch configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<Batch>,
    /// Cancellation triggers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancel_on: Vec<CancelOn>,
    /// Idempotency key expression; identical evaluated keys dedupe runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency: Option<String>,
    /// Maximum attempts per step, including the first (default 4).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Fixed retry interval in seconds; `>= 1` selects a linear schedule,
    /// absent/zero selects capped exponential with jitter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval_secs: Option<u64>,
    /// Per-dispatch timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Slug of a step to run after all retries are exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
}

impl Function {
    /// Deterministically derive an app ID from its URL.
    pub fn derive_app_id(url: &str) -> Uuid {
        Uuid::new_v5(&ID_NAMESPACE, url.as_bytes())
    }

    /// Deterministically derive a function ID from app ID + slug.
    pub fn derive_id(app_id: Uuid, slug: &str) -> Uuid {
        let mut name = app_id.as_bytes().to_vec();
        name.extend_from_slice(slug.as_bytes());
        Uuid::new_v5(&ID_NAMESPACE, &name)
    }

    /// Hash of the version-relevant configuration. Re-syncing an unchanged
    /// function reuses its version; a changed hash bumps it.
    pub fn config_hash(&self) -> String {
        // Hash a copy with identity fields zeroed so only config matters.
        let mut cfg = self.clone();
        cfg.version = 0;
        let bytes = serde_json::to_vec(&cfg).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        hex::encode(digest)
    }

    /// Maximum attempts per step.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1)
    }

    /// Per-dispatch timeout.
    pub fn dispatch_timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Event-trigger pairs `(event_name, expression)` for this function.
    pub fn event_triggers(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.triggers.iter().filter_map(|t| match t {
            Trigger::Event { event, expression } => Some((event.as_str(), expression.as_deref())),
            Trigger::Cron { .. } => None,
        })
    }

    /// Cron patterns for this function.
    pub fn cron_triggers(&self) -> impl Iterator<Item = &str> {
        self.triggers.iter().filter_map(|t| match t {
            Trigger::Cron { cron } => Some(cron.as_str()),
            Trigger::Event { .. } => None,
        })
    }
}

/// Stable hash of a custom concurrency/throttle key expression. Stored with
/// queue items so limits stay associated even if the expression changes in a
/// later function version.
pub fn key_expression_hash(expression: &str) -> String {
    let digest = Sha256::digest(expression.as_bytes());
    hex::encode(&digest[..8])
}

/// Read access to the currently-deployed function configs.
///
/// The queue evaluates concurrency limits through this at lease time so that
/// limits reflect the latest deployed version, not the version that enqueued.
pub trait FunctionLoader: Send + Sync {
    /// Look up a function by ID. Returns the latest version.
    fn function(&self, id: Uuid) -> Option<Function>;

    /// All functions with an event trigger for this event name.
    fn functions_by_event(&self, event_name: &str) -> Vec<Function>;

    /// All functions with at least one cron trigger.
    fn functions_with_cron(&self) -> Vec<Function> {
        Vec::new()
    }
}
