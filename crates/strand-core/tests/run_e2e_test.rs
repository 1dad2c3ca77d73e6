// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for the run lifecycle: dispatch, memoization, retries, sleeps.

mod common;

use common::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use strand_core::state::{RunStatus, StateStore};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_step_run_completes() {
    let ctx = TestContext::start(|uri| vec![function(uri, "single", "test/run")]).await;
    ctx.mount_sdk(|body| {
        if has_step(body, "load") {
            complete(json!({"loaded": true}))
        } else {
            partial(json!([{"op": "StepRun", "id": "load", "name": "load", "data": {"rows": 3}}]))
        }
    })
    .await;

    let runs = ctx.send("test/run", json!({"n": 1})).await;
    assert_eq!(runs.len(), 1);

    ctx.wait_for_status(runs[0], RunStatus::Completed, Duration::from_secs(5)).await;

    let steps = ctx.state.steps(runs[0]).await.unwrap();
    assert_eq!(steps["load"], json!({"data": {"rows": 3}}));

    // First dispatch had no memoized steps, the second replayed with them.
    let bodies = ctx.dispatches().await;
    assert!(bodies.len() >= 2);
    assert!(!has_step(&bodies[0], "load"));
    assert!(has_step(bodies.last().unwrap(), "load"));

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_multi_step_replay_in_order() {
    let ctx = TestContext::start(|uri| vec![function(uri, "multi", "test/run")]).await;
    ctx.mount_sdk(|body| {
        if !has_step(body, "first") {
            partial(json!([{"op": "StepRun", "id": "first", "data": 1}]))
        } else if !has_step(body, "second") {
            partial(json!([{"op": "StepRun", "id": "second", "data": 2}]))
        } else {
            complete(json!("done"))
        }
    })
    .await;

    let runs = ctx.send("test/run", json!({})).await;
    let _ = ctx.wait_for_status(runs[0], RunStatus::Completed, Duration::from_secs(5)).await;

    let stack = ctx.state.stack(runs[0]).await.unwrap();
    assert_eq!(stack, vec!["first".to_string(), "second".to_string()]);

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_then_success() {
    let ctx = TestContext::start(|uri| {
        let mut f = function(uri, "flaky", "test/run");
        f.retry_interval_secs = Some(1);
        vec![f]
    })
    .await;

    let calls = AtomicUsize::new(0);
    ctx.mount_sdk(move |_body| {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            step_error("transient failure")
        } else {
            complete(json!("recovered"))
        }
    })
    .await;

    let runs = ctx.send("test/run", json!({})).await;
    ctx.wait_for_status(runs[0], RunStatus::Completed, Duration::from_secs(10)).await;

    // The retry dispatch carries the bumped attempt counter.
    let bodies = ctx.dispatches().await;
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["ctx"]["attempt"], 0);
    assert_eq!(bodies[1]["ctx"]["attempt"], 1);

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retries_exhausted_fails_run() {
    let ctx = TestContext::start(|uri| {
        let mut f = function(uri, "doomed", "test/run");
        f.max_attempts = Some(2);
        f.retry_interval_secs = Some(1);
        vec![f]
    })
    .await;
    ctx.mount_sdk(|_body| step_error("permanent failure")).await;

    let runs = ctx.send("test/run", json!({})).await;
    ctx.wait_for_status(runs[0], RunStatus::Failed, Duration::from_secs(10)).await;

    assert_eq!(ctx.dispatches().await.len(), 2);

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_retry_header_fails_immediately() {
    let ctx = TestContext::start(|uri| vec![function(uri, "fatal", "test/run")]).await;
    ctx.mount_sdk(|_body| {
        step_error("unrecoverable").insert_header("x-strand-no-retry", "true")
    })
    .await;

    let runs = ctx.send("test/run", json!({})).await;
    ctx.wait_for_status(runs[0], RunStatus::Failed, Duration::from_secs(5)).await;

    assert_eq!(ctx.dispatches().await.len(), 1);

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sleep_wakes_and_completes() {
    let ctx = TestContext::start(|uri| vec![function(uri, "sleeper", "test/run")]).await;
    let wake_at = now_ms() + 300;
    ctx.mount_sdk(move |body| {
        if has_step(body, "nap") {
            complete(json!("rested"))
        } else {
            partial(json!([{"op": "Sleep", "id": "nap", "opts": {"until_ms": wake_at}}]))
        }
    })
    .await;

    let runs = ctx.send("test/run", json!({})).await;
    ctx.wait_for_status(runs[0], RunStatus::Completed, Duration::from_secs(5)).await;

    // The sleep memoizes as a null step output.
    let steps = ctx.state.steps(runs[0]).await.unwrap();
    assert_eq!(steps["nap"], serde_json::Value::Null);
    assert!(now_ms() >= wake_at);

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idempotent_events_schedule_one_run() {
    let ctx = TestContext::start(|uri| {
        let mut f = function(uri, "once", "test/run");
        f.idempotency = Some("event.data.order_id".to_string());
        vec![f]
    })
    .await;
    ctx.mount_sdk(|_body| complete(json!("ok"))).await;

    let first = ctx.send("test/run", json!({"order_id": "A-1"})).await;
    let second = ctx.send("test/run", json!({"order_id": "A-1"})).await;
    let other = ctx.send("test/run", json!({"order_id": "B-2"})).await;
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    assert_eq!(other.len(), 1);

    ctx.wait_for_status(first[0], RunStatus::Completed, Duration::from_secs(5)).await;
    ctx.wait_for_status(other[0], RunStatus::Completed, Duration::from_secs(5)).await;

    ctx.shutdown().await;
}
