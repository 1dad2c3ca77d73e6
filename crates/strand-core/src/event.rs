// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event types and validation.
//!
//! Events are the unit of ingestion: every run is triggered by one or more
//! events, and finished runs emit system events (`strand/function.finished`
//! and friends) that other functions and pending invoke-pauses can consume.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::EngineError;
use crate::ids;

/// Maximum ingest body size: 512 KiB.
pub const MAX_EVENT_BODY_BYTES: usize = 512 * 1024;

/// How far into the future an event timestamp may point: 2 minutes.
pub const MAX_FUTURE_TS_MS: i64 = 2 * 60 * 1000;

/// Name of the system event emitted when a run completes successfully.
pub const FN_FINISHED: &str = "strand/function.finished";
/// Name of the system event emitted when a run fails terminally.
pub const FN_FAILED: &str = "strand/function.failed";
/// Name of the system event emitted when a run is cancelled.
pub const FN_CANCELLED: &str = "strand/function.cancelled";
/// Name of the synthetic trigger event used for cross-function invocation.
pub const FN_INVOKED: &str = "strand/function.invoked";

/// Key within event data carrying the invoke correlation ID.
pub const CORRELATION_KEY: &str = "_strand_correlation_id";

/// An event as stored and matched by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Caller-provided external ID. May collide; never authoritative.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Event name, e.g. `order/created`. Required; a missing name still
    /// deserializes (as empty) so [`Event::validate`] can reject it.
    #[serde(default)]
    pub name: String,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub data: Value,
    /// Optional user-identification payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub user: Value,
    /// Unix-millisecond timestamp. Zero means "assign at ingest".
    #[serde(default)]
    pub ts: i64,
    /// Payload format version.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v: String,
}

impl Event {
    /// Validate an event at ingest time.
    ///
    /// Rules: `name` is required; `ts` must not be more than two minutes in
    /// the future.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.is_empty() {
            return Err(EngineError::Validation {
                field: "name".to_string(),
                message: "event name is required".to_string(),
            });
        }
        let now = Utc::now().timestamp_millis();
        if self.ts > now + MAX_FUTURE_TS_MS {
            return Err(EngineError::Validation {
                field: "ts".to_string(),
                message: format!("timestamp {} is too far in the future", self.ts),
            });
        }
        Ok(())
    }

    /// Whether this is an internal system event (`strand/` prefix).
    pub fn is_system(&self) -> bool {
        self.name.starts_with("strand/")
    }

    /// The invoke correlation ID carried in `data`, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.data.get(CORRELATION_KEY).and_then(Value::as_str)
    }

    /// Evaluation scope for trigger expressions: `{"event": {...}}`.
    pub fn scope(&self) -> Value {
        json!({ "event": self.map() })
    }

    /// JSON object form used in expression scopes and SDK requests.
    pub fn map(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "data": self.data,
            "user": self.user,
            "ts": self.ts,
            "v": self.v,
        })
    }
}

/// An event paired with its engine-assigned internal ID.
///
/// The internal ID is a UUIDv7 generated (or idempotency-seeded) at ingest;
/// ordering between events is always by internal ID time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedEvent {
    /// Time-ordered internal ID.
    pub internal_id: Uuid,
    /// The event payload.
    pub event: Event,
}

impl TrackedEvent {
    /// Track an event, assigning a fresh internal ID and stamping `ts` when
    /// the caller left it at zero.
    pub fn new(mut event: Event) -> Self {
        if event.ts == 0 {
            event.ts = Utc::now().timestamp_millis();
        }
        Self { internal_id: ids::new_id(), event }
    }

    /// Track an event with a deterministic, idempotency-seeded internal ID.
    pub fn seeded(mut event: Event, unix_ms: u64, entropy: &[u8]) -> Self {
        if event.ts == 0 {
            event.ts = Utc::now().timestamp_millis();
        }
        Self { internal_id: ids::seeded_id(unix_ms, entropy), event }
    }

    /// Millisecond timestamp embedded in the internal ID.
    pub fn received_at_ms(&self) -> u64 {
        ids::id_millis(&self.internal_id)
    }
}

/// Build the `function.finished` system event for a completed run.
pub fn function_finished(function_id: Uuid, run_id: Uuid, correlation: Option<&str>, result: Value) -> Event {
    let mut data = json!({
        "function_id": function_id,
        "run_id": run_id,
        "result": result,
    });
    if let Some(corr) = correlation {
        data[CORRELATION_KEY] = Value::String(corr.to_string());
    }
    Event {
        id: String::new(),
        name: FN_FINISHED.to_string(),
        data,
        user: Value::Null,
        ts: Utc::now().timestamp_millis(),
        v: String::new(),
    }
}

/// Build the `function.failed` system event for a failed run.
pub fn function_failed(function_id: Uuid, run_id: Uuid, correlation: Option<&str>, error: Value) -> Event {
    let mut data = json!({
        "function_id": function_id,
        "run_id": run_id,
        "error": error,
    });
    if let Some(corr) = correlation {
        data[CORRELATION_KEY] = Value::String(corr.to_string());
    }
    Event {
        id: String::new(),
        name: FN_FAILED.to_string(),
        data,
        user: Value::Null,
        ts: Utc::now().timestamp_millis(),
        v: String::new(),
    }
}

/// Build the `function.cancelled` system event.
pub fn function_cancelled(function_id: Uuid, run_id: Uuid) -> Event {
    Event {
        id: String::new(),
        name: FN_CANCELLED.to_string(),
        data: json!({ "function_id": function_id, "run_id": run_id }),
        user: Value::Null,
        ts: Utc::now().timestamp_millis(),
        v: String::new(),
    }
}

/// Build the synthetic trigger event for a cross-function invocation.
pub fn function_invoked(target: Uuid, correlation: &str, payload: Value) -> Event {
    Event {
        id: String::new(),
        name: FN_INVOKED.to_string(),
        data: json!({
            "function_id": target,
            CORRELATION_KEY: correlation,
            "payload": payload,
        }),
        user: Value::Null,
        ts: Utc::now().timestamp_millis(),
        v: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str) -> Event {
        Event {
            id: String::new(),
            name: name.to_string(),
            data: json!({"n": 1}),
            user: Value::Null,
            ts: 0,
            v: String::new(),
        }
    }

    #[test]
    fn test_validate_requires_name() {
        let e = event("");
        let err = e.validate().unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_nameless_json_deserializes_then_fails_validation() {
        let e: Event = serde_json::from_str(r#"{"data": {"n": 1}}"#).unwrap();
        assert!(e.name.is_empty());
        let err = e.validate().unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_validate_rejects_far_future_ts() {
        let mut e = event("test/hello");
        e.ts = Utc::now().timestamp_millis() + MAX_FUTURE_TS_MS + 10_000;
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_near_future_ts() {
        let mut e = event("test/hello");
        e.ts = Utc::now().timestamp_millis() + 30_000;
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_tracked_event_stamps_ts() {
        let tracked = TrackedEvent::new(event("test/hello"));
        assert!(tracked.event.ts > 0);
        assert!(tracked.received_at_ms() > 0);
    }

    #[test]
    fn test_data_round_trip() {
        let payload = json!({"nested": {"unicode": "héllo", "n": [1, 2.5, null, true]}});
        let mut e = event("test/round-trip");
        e.data = payload.clone();
        let bytes = serde_json::to_vec(&e).unwrap();
        let back: Event = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.data, payload);
    }

    #[test]
    fn test_correlation_id() {
        let e = function_invoked(Uuid::new_v4(), "corr-1", json!({"a": 1}));
        assert_eq!(e.correlation_id(), Some("corr-1"));
        assert!(e.is_system());
        assert!(event("user/x").correlation_id().is_none());
    }

    #[test]
    fn test_scope_shape() {
        let e = event("test/hello");
        let scope = e.scope();
        assert_eq!(scope["event"]["name"], "test/hello");
        assert_eq!(scope["event"]["data"]["n"], 1);
    }
}
