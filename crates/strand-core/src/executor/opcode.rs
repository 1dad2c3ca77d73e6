// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Opcodes returned by SDK responses.
//!
//! A partial (206) SDK response carries a list of opcodes describing what the
//! function did in this dispatch: finished steps, sleeps, waits and
//! invocations. Step IDs are SDK-hashed and opaque to the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Operation kinds an SDK may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// A step ran to completion; `data` holds its output.
    StepRun,
    /// A step threw; `error` holds the serialized error.
    StepError,
    /// The function sleeps until `opts.until_ms`.
    Sleep,
    /// The function waits for a matching event.
    WaitForEvent,
    /// The function waits for a named signal.
    WaitForSignal,
    /// The function invokes another function and waits for its result.
    Invoke,
    /// The engine performs an inference call on the function's behalf.
    AIGateway,
}

/// One opcode from a partial SDK response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpCode {
    /// Operation kind.
    pub op: Op,
    /// SDK-hashed step ID.
    pub id: String,
    /// Human-readable step name.
    #[serde(default)]
    pub name: String,
    /// Step output for `StepRun`.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    /// Serialized error for `StepError`.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub error: Value,
    /// Operation-specific options.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub opts: Value,
}

impl OpCode {
    /// `Sleep`: absolute wake time in unix milliseconds.
    pub fn sleep_until_ms(&self) -> Option<u64> {
        self.opts.get("until_ms").and_then(Value::as_u64)
    }

    /// `WaitForEvent`: the awaited event name.
    pub fn wait_event(&self) -> Option<&str> {
        self.opts.get("event").and_then(Value::as_str)
    }

    /// `WaitForEvent`: optional match expression.
    pub fn wait_expression(&self) -> Option<&str> {
        self.opts.get("expression").and_then(Value::as_str)
    }

    /// `WaitForSignal`: the awaited signal name.
    pub fn signal(&self) -> Option<&str> {
        self.opts.get("signal").and_then(Value::as_str)
    }

    /// `Invoke`: the target function ID string.
    pub fn invoke_function_id(&self) -> Option<&str> {
        self.opts.get("function_id").and_then(Value::as_str)
    }

    /// `Invoke`: the payload passed to the child run.
    pub fn invoke_payload(&self) -> Value {
        self.opts.get("payload").cloned().unwrap_or(Value::Null)
    }

    /// Wait/invoke timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.opts.get("timeout_secs").and_then(Value::as_u64).map(Duration::from_secs)
    }

    /// `AIGateway`: inference endpoint URL.
    pub fn gateway_url(&self) -> Option<&str> {
        self.opts.get("url").and_then(Value::as_str)
    }

    /// `AIGateway`: request headers object.
    pub fn gateway_headers(&self) -> Value {
        self.opts.get("headers").cloned().unwrap_or(Value::Null)
    }

    /// `AIGateway`: request body.
    pub fn gateway_body(&self) -> Value {
        self.opts.get("body").cloned().unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_step_run() {
        let op: OpCode = serde_json::from_value(json!({
            "op": "StepRun",
            "id": "a1b2",
            "name": "load-user",
            "data": {"user": 7},
        }))
        .unwrap();
        assert_eq!(op.op, Op::StepRun);
        assert_eq!(op.data["user"], 7);
    }

    #[test]
    fn test_wait_opts() {
        let op: OpCode = serde_json::from_value(json!({
            "op": "WaitForEvent",
            "id": "w1",
            "opts": {
                "event": "approval/granted",
                "expression": "async.data.id == event.data.id",
                "timeout_secs": 3600,
            },
        }))
        .unwrap();
        assert_eq!(op.wait_event(), Some("approval/granted"));
        assert!(op.wait_expression().is_some());
        assert_eq!(op.timeout(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_sleep_opts() {
        let op: OpCode = serde_json::from_value(json!({
            "op": "Sleep",
            "id": "s1",
            "opts": {"until_ms": 1_700_000_000_000u64},
        }))
        .unwrap();
        assert_eq!(op.sleep_until_ms(), Some(1_700_000_000_000));
    }
}
