// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for strand-core E2E tests.
//!
//! Runs the full engine (runner, executor, runtime) over the in-memory
//! backend, with a wiremock server standing in for the SDK endpoint.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use strand_core::batch::MemoryBatchStore;
use strand_core::debounce::{Debouncer, MemoryDebounceStore};
use strand_core::event::{Event, TrackedEvent};
use strand_core::executor::{Executor, HttpDriver};
use strand_core::function::{Function, FunctionLoader, Trigger};
use strand_core::pauses::{MemoryPauseStore, PauseStore};
use strand_core::queue::MemoryQueue;
use strand_core::ratelimit::MemoryRateLimiter;
use strand_core::runner::Runner;
use strand_core::runtime::EngineRuntime;
use strand_core::state::{MemoryStateStore, RunMetadata, RunStatus, StateLimits, StateStore};

/// Function lookup over a fixed set, as the server registry would provide.
pub struct MapLoader(pub HashMap<Uuid, Function>);

impl FunctionLoader for MapLoader {
    fn function(&self, id: Uuid) -> Option<Function> {
        self.0.get(&id).cloned()
    }

    fn functions_by_event(&self, event_name: &str) -> Vec<Function> {
        self.0
            .values()
            .filter(|f| f.event_triggers().any(|(e, _)| e == event_name))
            .cloned()
            .collect()
    }

    fn functions_with_cron(&self) -> Vec<Function> {
        self.0.values().filter(|f| f.cron_triggers().next().is_some()).cloned().collect()
    }
}

/// A replay-aware fake SDK: each response is decided from the request body,
/// typically by looking at which steps are already memoized.
pub struct SdkFn<F>(pub F);

impl<F> Respond for SdkFn<F>
where
    F: Fn(&Value) -> ResponseTemplate + Send + Sync,
{
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        (self.0)(&body)
    }
}

/// Whether the request body carries a memoized output for `step_id`.
pub fn has_step(body: &Value, step_id: &str) -> bool {
    body["steps"].get(step_id).is_some()
}

/// A 200 response: the function finished with `output`.
pub fn complete(output: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(output)
}

/// A 206 response carrying opcodes.
pub fn partial(ops: Value) -> ResponseTemplate {
    ResponseTemplate::new(206).set_body_json(ops)
}

/// A retriable 500 step error.
pub fn step_error(message: &str) -> ResponseTemplate {
    ResponseTemplate::new(500).set_body_json(json!({"message": message}))
}

/// Test context running the whole engine over memory stores.
pub struct TestContext {
    pub server: MockServer,
    pub queue: Arc<MemoryQueue>,
    pub state: Arc<MemoryStateStore>,
    pub pauses: Arc<MemoryPauseStore>,
    pub runner: Arc<Runner>,
    pub runtime: EngineRuntime,
}

impl TestContext {
    /// Start a mock SDK server plus an engine runtime over the functions
    /// `build` returns for the server's URI.
    pub async fn start(build: impl FnOnce(&str) -> Vec<Function>) -> Self {
        let server = MockServer::start().await;
        let functions = build(&server.uri());
        let loader =
            Arc::new(MapLoader(functions.into_iter().map(|f| (f.id, f)).collect()));

        let queue = Arc::new(MemoryQueue::default());
        let state = Arc::new(MemoryStateStore::new(StateLimits::default()));
        let pauses = Arc::new(MemoryPauseStore::new());
        let runner = Arc::new(Runner::new(
            queue.clone(),
            state.clone(),
            pauses.clone(),
            Arc::new(MemoryBatchStore::new()),
            Debouncer::new(Arc::new(MemoryDebounceStore::new()), queue.clone()),
            loader.clone(),
            Arc::new(MemoryRateLimiter::new()),
        ));
        let executor = Arc::new(Executor::new(
            queue.clone(),
            state.clone(),
            pauses.clone(),
            Arc::new(HttpDriver::new(None)),
            loader,
            runner.clone(),
        ));

        let runtime = EngineRuntime::builder()
            .queue(queue.clone())
            .executor(executor)
            .runner(runner.clone())
            .worker_count(8)
            .poll_interval(Duration::from_millis(10))
            .build()
            .expect("runtime config")
            .start()
            .await
            .expect("runtime start");

        Self { server, queue, state, pauses, runner, runtime }
    }

    /// Mount an SDK behavior for all dispatches.
    pub async fn mount_sdk<F>(&self, behavior: F)
    where
        F: Fn(&Value) -> ResponseTemplate + Send + Sync + 'static,
    {
        Mock::given(method("POST")).respond_with(SdkFn(behavior)).mount(&self.server).await;
    }

    /// Ingest an event, returning the run IDs it scheduled.
    pub async fn send(&self, name: &str, data: Value) -> Vec<Uuid> {
        let tracked = TrackedEvent::new(Event {
            id: String::new(),
            name: name.to_string(),
            data,
            user: Value::Null,
            ts: 0,
            v: String::new(),
        });
        self.runner.ingest(&tracked).await.expect("ingest")
    }

    /// Poll until the run reaches `want`, panicking after `timeout`.
    pub async fn wait_for_status(
        &self,
        run_id: Uuid,
        want: RunStatus,
        timeout: Duration,
    ) -> RunMetadata {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(meta) = self.state.load_run(run_id).await {
                if meta.status == want {
                    return meta;
                }
                assert!(
                    !meta.status.is_terminal(),
                    "run {run_id} reached {:?}, expected {want:?}",
                    meta.status
                );
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "run {run_id} did not reach {want:?} within {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until the SDK has received at least `count` dispatches.
    pub async fn wait_for_dispatches(&self, count: usize, timeout: Duration) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let bodies = self.dispatches().await;
            if bodies.len() >= count {
                return bodies;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {count} dispatches, saw {} within {timeout:?}",
                bodies.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Request bodies of all SDK dispatches so far.
    pub async fn dispatches(&self) -> Vec<Value> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|r| serde_json::from_slice(&r.body).unwrap_or(Value::Null))
            .collect()
    }

    /// Poll until an unconsumed pause waits on `event_name`.
    pub async fn wait_for_pause(&self, event_name: &str, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let waiting = self.pauses.pauses_by_event(event_name).await.expect("pause index");
            if !waiting.is_empty() {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no pause registered for '{event_name}' within {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn shutdown(self) {
        self.runtime.shutdown().await.expect("clean shutdown");
    }
}

/// A minimal function dispatching to `url`, triggered by `event`.
pub fn function(url: &str, slug: &str, event: &str) -> Function {
    let app_id = Function::derive_app_id(url);
    Function {
        id: Function::derive_id(app_id, slug),
        app_id,
        slug: slug.to_string(),
        name: String::new(),
        version: 1,
        url: url.to_string(),
        triggers: vec![Trigger::Event { event: event.to_string(), expression: None }],
        concurrency: Vec::new(),
        rate_limit: None,
        throttle: None,
        priority: None,
        debounce: None,
        batch: None,
        cancel_on: Vec::new(),
        idempotency: None,
        max_attempts: None,
        retry_interval_secs: None,
        timeout_secs: None,
        on_failure: None,
    }
}

/// Current unix milliseconds, for sleep opcodes.
pub fn now_ms() -> u64 {
    strand_core::ids::now_ms()
}
