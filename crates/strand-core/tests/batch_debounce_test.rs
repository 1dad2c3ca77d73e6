// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for event batching and debouncing.

mod common;

use common::*;
use serde_json::json;
use std::time::Duration;
use strand_core::function::{Batch, Debounce};
use strand_core::state::RunStatus;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_flushes_when_full() {
    let ctx = TestContext::start(|uri| {
        let mut f = function(uri, "batcher", "metric/point");
        f.batch = Some(Batch { max_size: 2, timeout_secs: 60, key: None });
        vec![f]
    })
    .await;
    ctx.mount_sdk(|_body| complete(json!("flushed"))).await;

    // The first event opens the batch; the second fills and flushes it.
    let first = ctx.send("metric/point", json!({"v": 1})).await;
    assert!(first.is_empty());
    let second = ctx.send("metric/point", json!({"v": 2})).await;
    assert_eq!(second.len(), 1);

    ctx.wait_for_status(second[0], RunStatus::Completed, Duration::from_secs(5)).await;

    // The run carries both batched events.
    let bodies = ctx.wait_for_dispatches(1, Duration::from_secs(5)).await;
    let events = bodies[0]["events"].as_array().expect("events array");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["data"]["v"], 1);
    assert_eq!(events[1]["data"]["v"], 2);

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_flushes_on_timeout() {
    let ctx = TestContext::start(|uri| {
        let mut f = function(uri, "batcher", "metric/point");
        f.batch = Some(Batch { max_size: 10, timeout_secs: 1, key: None });
        vec![f]
    })
    .await;
    ctx.mount_sdk(|_body| complete(json!("flushed"))).await;

    let runs = ctx.send("metric/point", json!({"v": 7})).await;
    assert!(runs.is_empty());

    // The timeout item fires through the runtime and flushes the partial batch.
    let bodies = ctx.wait_for_dispatches(1, Duration::from_secs(10)).await;
    let events = bodies[0]["events"].as_array().expect("events array");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["data"]["v"], 7);

    let run_id = bodies[0]["ctx"]["run_id"].as_str().unwrap().parse().unwrap();
    ctx.wait_for_status(run_id, RunStatus::Completed, Duration::from_secs(5)).await;

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_keys_are_independent() {
    let ctx = TestContext::start(|uri| {
        let mut f = function(uri, "batcher", "metric/point");
        f.batch = Some(Batch {
            max_size: 2,
            timeout_secs: 60,
            key: Some("event.data.tenant".to_string()),
        });
        vec![f]
    })
    .await;
    ctx.mount_sdk(|_body| complete(json!("flushed"))).await;

    // Two tenants fill separate batches; neither flushes on one event each.
    assert!(ctx.send("metric/point", json!({"tenant": "a", "v": 1})).await.is_empty());
    assert!(ctx.send("metric/point", json!({"tenant": "b", "v": 1})).await.is_empty());

    let flushed = ctx.send("metric/point", json!({"tenant": "a", "v": 2})).await;
    assert_eq!(flushed.len(), 1);
    ctx.wait_for_status(flushed[0], RunStatus::Completed, Duration::from_secs(5)).await;

    let bodies = ctx.dispatches().await;
    let events = bodies[0]["events"].as_array().expect("events array");
    assert!(events.iter().all(|e| e["data"]["tenant"] == "a"));

    ctx.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_debounce_runs_latest_event_after_quiet_period() {
    let ctx = TestContext::start(|uri| {
        let mut f = function(uri, "debounced", "doc/updated");
        f.debounce = Some(Debounce { period_secs: 1, timeout_secs: None, key: None });
        vec![f]
    })
    .await;
    ctx.mount_sdk(|_body| complete(json!("saved"))).await;

    // Rapid updates fold into one pending debounce.
    assert!(ctx.send("doc/updated", json!({"rev": 1})).await.is_empty());
    assert!(ctx.send("doc/updated", json!({"rev": 2})).await.is_empty());
    assert!(ctx.send("doc/updated", json!({"rev": 3})).await.is_empty());

    // After the quiet period one run starts, carrying only the latest payload.
    let bodies = ctx.wait_for_dispatches(1, Duration::from_secs(10)).await;
    assert_eq!(bodies[0]["event"]["data"]["rev"], 3);

    let run_id = bodies[0]["ctx"]["run_id"].as_str().unwrap().parse().unwrap();
    ctx.wait_for_status(run_id, RunStatus::Completed, Duration::from_secs(5)).await;
    assert_eq!(ctx.dispatches().await.len(), 1);

    ctx.shutdown().await;
}
