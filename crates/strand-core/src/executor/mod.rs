// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The executor: drives runs forward one dispatch at a time.
//!
//! Each leased queue item triggers one SDK dispatch. The SDK replays
//! memoized steps from the state we send, executes at most one new step, and
//! reports what happened as opcodes. The executor persists outcomes, enqueues
//! follow-up work and emits system events on terminal transitions. Step
//! writes are exactly-once; everything around them is at-least-once, so every
//! handler treats duplicate errors as success.

pub mod driver;
pub mod opcode;

pub use driver::{Driver, DriverResponse, HttpDriver, SdkReply};
pub use opcode::{Op, OpCode};

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::backoff;
use crate::error::{EngineError, Result};
use crate::event::{self, Event};
use crate::function::{Function, FunctionLoader};
use crate::ids;
use crate::lifecycle::LifecycleListener;
use crate::pauses::{Pause, PauseStore, PAUSE_LEASE};
use crate::queue::{ItemKind, LeaseId, Queue, QueueItem};
use crate::state::{RunMetadata, RunStatus, StateStore};

/// Default timeout for waits that set none: 1 year.
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Slack between the dispatch deadline and the lease expiry, so the response
/// is still persisted under a live lease.
const LEASE_MARGIN: Duration = Duration::from_secs(2);

/// Per-attempt dispatch deadline: the function's timeout clamped to the
/// remaining lease.
fn dispatch_deadline(function: &Function, lease: LeaseId) -> Duration {
    let remaining = Duration::from_millis(lease.expires_at_ms().saturating_sub(ids::now_ms()))
        .saturating_sub(LEASE_MARGIN)
        .max(Duration::from_secs(1));
    function.dispatch_timeout().unwrap_or(driver::DEFAULT_DISPATCH_TIMEOUT).min(remaining)
}

/// Emits events back into the ingestion pipeline (system events, invokes).
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    async fn send(&self, event: Event) -> Result<()>;
}

/// A sink that drops everything. For tests and tooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait::async_trait]
impl EventSink for NullSink {
    async fn send(&self, _event: Event) -> Result<()> {
        Ok(())
    }
}

/// Drives run execution from leased queue items.
pub struct Executor {
    queue: Arc<dyn Queue>,
    state: Arc<dyn StateStore>,
    pauses: Arc<dyn PauseStore>,
    driver: Arc<dyn Driver>,
    loader: Arc<dyn FunctionLoader>,
    sink: Arc<dyn EventSink>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

impl Executor {
    /// Wire an executor over its stores and driver.
    pub fn new(
        queue: Arc<dyn Queue>,
        state: Arc<dyn StateStore>,
        pauses: Arc<dyn PauseStore>,
        driver: Arc<dyn Driver>,
        loader: Arc<dyn FunctionLoader>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self { queue, state, pauses, driver, loader, sink, listeners: Vec::new() }
    }

    /// Register a lifecycle listener.
    pub fn add_listener(&mut self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.push(listener);
    }

    /// Process one leased queue item.
    #[tracing::instrument(skip_all, fields(item = %item.id, kind = ?item.kind))]
    pub async fn process(&self, item: &QueueItem, lease: LeaseId) -> Result<()> {
        match item.kind {
            ItemKind::Start | ItemKind::Edge | ItemKind::EdgeError | ItemKind::Sleep => {
                self.execute(item, lease).await
            }
            ItemKind::Pause => self.pause_timeout(item, lease).await,
            ItemKind::Cancel => self.cancel_item(item, lease).await,
            other => {
                tracing::warn!(kind = ?other, "unroutable item kind reached the executor");
                self.queue.dequeue(&item.id, lease).await
            }
        }
    }

    async fn execute(&self, item: &QueueItem, lease: LeaseId) -> Result<()> {
        let Some(run_id) = item.run_id else {
            tracing::error!("execution item without run id");
            return self.queue.dequeue(&item.id, lease).await;
        };
        let Some(function) = self.loader.function(item.function_id) else {
            // Function was unregistered; drop the work.
            tracing::warn!(function_id = %item.function_id, "function no longer registered");
            return self.queue.dequeue(&item.id, lease).await;
        };

        let meta = self.state.load_run(run_id).await?;
        if meta.status.is_terminal() {
            return self.queue.dequeue(&item.id, lease).await;
        }

        if item.kind == ItemKind::Start {
            self.state.set_status(run_id, RunStatus::Running, ids::now_ms()).await?;
            for l in &self.listeners {
                l.on_run_started(&meta.identifier).await;
            }
        }

        // A sleep item wakes by memoizing the sleep step, then dispatching.
        if item.kind == ItemKind::Sleep {
            if let Some(step_id) = item.payload.get("step_id").and_then(Value::as_str) {
                self.write_step(&meta, step_id, &Value::Null).await?;
            }
        }

        let body = self.request_body(&meta, item).await?;
        let deadline = dispatch_deadline(&function, lease);
        let resp = self.driver.dispatch(&function.url, &body, Some(deadline)).await?;
        if resp.request_version >= 0 && resp.request_version != meta.request_version {
            self.state.set_request_version(run_id, resp.request_version).await?;
        }

        match resp.reply {
            SdkReply::Complete { output } => {
                self.finalize_success(&function, &meta, output).await?;
                self.queue.dequeue(&item.id, lease).await
            }
            SdkReply::Steps(ops) => {
                // A reported step error fails the whole dispatch; retry
                // scheduling happens here where the lease is held.
                if let Some(err_op) = ops.iter().find(|o| o.op == Op::StepError) {
                    let error = if err_op.error.is_null() {
                        json!({"message": format!("step '{}' errored", err_op.id)})
                    } else {
                        err_op.error.clone()
                    };
                    if !item.can_retry() {
                        self.write_step(&meta, &err_op.id, &json!({"error": error})).await?;
                    }
                    return self
                        .handle_error(&function, &meta, item, lease, error, true, None)
                        .await;
                }
                match self.handle_opcodes(&function, &meta, item, &ops).await {
                    Ok(()) => self.queue.dequeue(&item.id, lease).await,
                    Err(
                        e @ (EngineError::StepLimitExceeded { .. }
                        | EngineError::StateSizeLimitExceeded { .. }),
                    ) => {
                        // Limits are fatal for the run, not retriable.
                        let error = json!({"message": e.to_string(), "code": e.error_code()});
                        self.finalize_failure(&function, &meta, error, RunStatus::Overflowed)
                            .await?;
                        self.queue.dequeue(&item.id, lease).await
                    }
                    Err(e) => Err(e),
                }
            }
            SdkReply::Error { error, retriable, retry_after } => {
                self.handle_error(&function, &meta, item, lease, error, retriable, retry_after)
                    .await
            }
        }
    }

    async fn request_body(&self, meta: &RunMetadata, item: &QueueItem) -> Result<Value> {
        let run_id = meta.identifier.run_id;
        let events = self.state.load_events(run_id).await?;
        let steps = self.state.steps(run_id).await?;
        let stack = self.state.stack(run_id).await?;
        let event_maps: Vec<Value> = events.iter().map(|t| t.event.map()).collect();
        Ok(json!({
            "ctx": {
                "run_id": run_id,
                "function_id": meta.identifier.function_id,
                "function_version": meta.identifier.function_version,
                "attempt": item.attempt,
                "stack": { "stack": stack.clone(), "current": stack.len() },
            },
            "event": event_maps.first().cloned().unwrap_or(Value::Null),
            "events": event_maps,
            "steps": steps,
        }))
    }

    async fn handle_opcodes(
        &self,
        function: &Function,
        meta: &RunMetadata,
        item: &QueueItem,
        ops: &[OpCode],
    ) -> Result<()> {
        let run_id = meta.identifier.run_id;
        for op in ops {
            match op.op {
                Op::StepRun => {
                    self.write_step(meta, &op.id, &json!({"data": op.data})).await?;
                    for l in &self.listeners {
                        l.on_step_finished(&meta.identifier, &op.id).await;
                    }
                    self.enqueue_edge(function, meta, item, &op.id, ids::now_ms()).await?;
                }
                // Step errors are filtered out before memoization.
                Op::StepError => {}
                Op::Sleep => {
                    let until = op.sleep_until_ms().unwrap_or_else(ids::now_ms);
                    let sleep = QueueItem {
                        id: format!("run:{run_id}:sleep:{}", op.id),
                        job_id: format!("run:{run_id}"),
                        kind: ItemKind::Sleep,
                        function_id: function.id,
                        run_id: Some(run_id),
                        attempt: 0,
                        max_attempts: function.max_attempts(),
                        at_ms: until,
                        payload: json!({"step_id": op.id}),
                        concurrency: item.concurrency.clone(),
                    };
                    match self.queue.enqueue(&sleep).await {
                        Ok(()) | Err(EngineError::Duplicate(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                Op::WaitForEvent => {
                    let pause = Pause {
                        id: ids::new_id(),
                        identifier: meta.identifier,
                        step_id: op.id.clone(),
                        event: op.wait_event().map(String::from),
                        expression: op.wait_expression().map(String::from),
                        correlation_id: None,
                        signal: None,
                        expires_at_ms: self.wait_deadline(op),
                        timeout_item_id: String::new(),
                        cancel: false,
                    };
                    self.install_pause(function, item, pause).await?;
                }
                Op::WaitForSignal => {
                    let pause = Pause {
                        id: ids::new_id(),
                        identifier: meta.identifier,
                        step_id: op.id.clone(),
                        event: None,
                        expression: None,
                        correlation_id: None,
                        signal: op.signal().map(String::from),
                        expires_at_ms: self.wait_deadline(op),
                        timeout_item_id: String::new(),
                        cancel: false,
                    };
                    self.install_pause(function, item, pause).await?;
                }
                Op::Invoke => {
                    let correlation = format!("{run_id}.{}", op.id);
                    let pause = Pause {
                        id: ids::new_id(),
                        identifier: meta.identifier,
                        step_id: op.id.clone(),
                        event: None,
                        expression: None,
                        correlation_id: Some(correlation.clone()),
                        signal: None,
                        expires_at_ms: self.wait_deadline(op),
                        timeout_item_id: String::new(),
                        cancel: false,
                    };
                    self.install_pause(function, item, pause).await?;

                    let target = op
                        .invoke_function_id()
                        .and_then(|s| Uuid::parse_str(s).ok())
                        .ok_or_else(|| EngineError::Validation {
                            field: "function_id".to_string(),
                            message: "invoke requires a target function id".to_string(),
                        })?;
                    self.sink
                        .send(event::function_invoked(target, &correlation, op.invoke_payload()))
                        .await?;
                }
                Op::AIGateway => {
                    let url = op.gateway_url().ok_or_else(|| EngineError::Validation {
                        field: "url".to_string(),
                        message: "ai gateway requires a url".to_string(),
                    })?;
                    let output =
                        self.driver.infer(url, &op.gateway_headers(), &op.gateway_body()).await?;
                    self.write_step(meta, &op.id, &json!({"data": output})).await?;
                    self.enqueue_edge(function, meta, item, &op.id, ids::now_ms()).await?;
                }
            }
        }
        Ok(())
    }

    /// Deadline for a wait opcode.
    fn wait_deadline(&self, op: &OpCode) -> u64 {
        ids::now_ms() + op.timeout().unwrap_or(DEFAULT_WAIT_TIMEOUT).as_millis() as u64
    }

    /// Persist a pause and its timeout item.
    async fn install_pause(
        &self,
        function: &Function,
        item: &QueueItem,
        mut pause: Pause,
    ) -> Result<()> {
        let timeout_item = QueueItem {
            id: format!("pause-timeout:{}", pause.id),
            job_id: format!("pause:{}", pause.id),
            kind: ItemKind::Pause,
            function_id: function.id,
            run_id: Some(pause.identifier.run_id),
            attempt: 0,
            max_attempts: 1,
            at_ms: pause.expires_at_ms,
            payload: json!({"pause_id": pause.id}),
            concurrency: item.concurrency.clone(),
        };
        pause.timeout_item_id = timeout_item.id.clone();
        self.pauses.save(&pause).await?;
        match self.queue.enqueue(&timeout_item).await {
            Ok(()) | Err(EngineError::Duplicate(_)) => {}
            Err(e) => return Err(e),
        }
        for l in &self.listeners {
            l.on_run_paused(&pause.identifier, pause.id).await;
        }
        Ok(())
    }

    /// Resume a consumed pause: memoize the step and enqueue the next edge.
    /// Shared by event matches, signals, invoke results and timeouts.
    pub async fn resume(&self, pause: &Pause, data: Value) -> Result<()> {
        let run_id = pause.identifier.run_id;
        if pause.cancel {
            self.cancel_run(run_id).await?;
        } else {
            let meta = self.state.load_run(run_id).await?;
            if meta.status.is_terminal() {
                self.pauses.delete(pause.id).await?;
                return Ok(());
            }
            let Some(function) = self.loader.function(pause.identifier.function_id) else {
                self.pauses.delete(pause.id).await?;
                return Ok(());
            };
            self.write_step(&meta, &pause.step_id, &data).await?;
            let edge = QueueItem {
                id: format!("run:{run_id}:resume:{}", pause.id),
                job_id: format!("run:{run_id}"),
                kind: ItemKind::Edge,
                function_id: function.id,
                run_id: Some(run_id),
                attempt: 0,
                max_attempts: function.max_attempts(),
                at_ms: ids::now_ms(),
                payload: Value::Null,
                concurrency: Vec::new(),
            };
            match self.queue.enqueue(&edge).await {
                Ok(()) | Err(EngineError::Duplicate(_)) => {}
                Err(e) => return Err(e),
            }
            for l in &self.listeners {
                l.on_run_resumed(&pause.identifier, pause.id).await;
            }
        }

        // Drop the timeout item; tolerate it being mid-flight.
        self.remove_timeout_item(pause).await?;
        self.pauses.delete(pause.id).await
    }

    async fn remove_timeout_item(&self, pause: &Pause) -> Result<()> {
        if pause.timeout_item_id.is_empty() {
            return Ok(());
        }
        match self
            .queue
            .remove(
                &pause.identifier.function_id.to_string(),
                &pause.timeout_item_id,
                ids::now_ms(),
            )
            .await
        {
            Ok(()) | Err(EngineError::AlreadyLeased(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drop every remaining pause of a finished run along with its timeout
    /// item. Without this, `cancel_on` pauses would sit in their indexes for
    /// the full pause TTL.
    async fn sweep_pauses(&self, run_id: Uuid) -> Result<()> {
        for pause in self.pauses.delete_by_run(run_id).await? {
            self.remove_timeout_item(&pause).await?;
        }
        Ok(())
    }

    /// Handle a fired pause timeout item.
    async fn pause_timeout(&self, item: &QueueItem, lease: LeaseId) -> Result<()> {
        let Some(pause_id) =
            item.payload.get("pause_id").and_then(Value::as_str).and_then(|s| Uuid::parse_str(s).ok())
        else {
            return self.queue.dequeue(&item.id, lease).await;
        };
        let now_ms = ids::now_ms();
        match self.pauses.lease(pause_id, now_ms).await {
            Ok(()) => {
                let pause = self.pauses.load(pause_id).await?;
                self.pauses.consume(pause_id, &Value::Null).await?;
                self.resume(&pause, Value::Null).await?;
                self.queue.dequeue(&item.id, lease).await
            }
            Err(EngineError::PauseConsumed(_)) => {
                // A winner consumed but may have crashed before resuming; the
                // stored resume data makes the resume replayable.
                let pause = self.pauses.load(pause_id).await?;
                let data = self.pauses.resume_data(pause_id).await?.unwrap_or(Value::Null);
                self.resume(&pause, data).await?;
                self.queue.dequeue(&item.id, lease).await
            }
            Err(EngineError::PauseNotFound(_)) => self.queue.dequeue(&item.id, lease).await,
            Err(EngineError::AlreadyLeased(_)) => {
                // A resumer holds the pause lease; look again shortly.
                self.queue.requeue(item, lease, now_ms + PAUSE_LEASE.as_millis() as u64).await
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_item(&self, item: &QueueItem, lease: LeaseId) -> Result<()> {
        if let Some(run_id) = item.run_id {
            self.cancel_run(run_id).await?;
        }
        self.queue.dequeue(&item.id, lease).await
    }

    /// Cancel a run, emitting the system event on the first transition.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        let meta = self.state.load_run(run_id).await?;
        if meta.status.is_terminal() {
            return Ok(());
        }
        self.state.finalize(run_id, RunStatus::Cancelled, ids::now_ms()).await?;
        self.sweep_pauses(run_id).await?;
        self.sink
            .send(event::function_cancelled(meta.identifier.function_id, run_id))
            .await?;
        for l in &self.listeners {
            l.on_run_cancelled(&meta.identifier).await;
        }
        Ok(())
    }

    async fn write_step(&self, meta: &RunMetadata, step_id: &str, output: &Value) -> Result<()> {
        match self.state.save_step(meta.identifier.run_id, step_id, output).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_idempotent_duplicate() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn enqueue_edge(
        &self,
        function: &Function,
        meta: &RunMetadata,
        item: &QueueItem,
        step_id: &str,
        at_ms: u64,
    ) -> Result<()> {
        let run_id = meta.identifier.run_id;
        let edge = QueueItem {
            id: format!("run:{run_id}:edge:{step_id}"),
            job_id: format!("run:{run_id}"),
            kind: ItemKind::Edge,
            function_id: function.id,
            run_id: Some(run_id),
            attempt: 0,
            max_attempts: function.max_attempts(),
            at_ms,
            payload: Value::Null,
            concurrency: item.concurrency.clone(),
        };
        match self.queue.enqueue(&edge).await {
            Ok(()) | Err(EngineError::Duplicate(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn handle_error(
        &self,
        function: &Function,
        meta: &RunMetadata,
        item: &QueueItem,
        lease: LeaseId,
        error: Value,
        retriable: bool,
        retry_after: Option<Duration>,
    ) -> Result<()> {
        for l in &self.listeners {
            l.on_step_errored(&meta.identifier, &item.id, item.attempt).await;
        }
        if retriable && item.can_retry() {
            let delay = retry_after.unwrap_or_else(|| {
                backoff::retry_delay(
                    item.attempt + 1,
                    function.retry_interval_secs.map(Duration::from_secs),
                )
            });
            let mut retry = item.clone();
            retry.attempt = item.attempt + 1;
            retry.kind = ItemKind::EdgeError;
            return self
                .queue
                .requeue(&retry, lease, ids::now_ms() + delay.as_millis() as u64)
                .await;
        }
        self.finalize_failure(function, meta, error, RunStatus::Failed).await?;
        self.queue.dequeue(&item.id, lease).await
    }

    async fn finalize_success(
        &self,
        function: &Function,
        meta: &RunMetadata,
        output: Value,
    ) -> Result<()> {
        let run_id = meta.identifier.run_id;
        self.state.finalize(run_id, RunStatus::Completed, ids::now_ms()).await?;
        self.sweep_pauses(run_id).await?;
        self.sink
            .send(event::function_finished(
                function.id,
                run_id,
                meta.correlation_id.as_deref(),
                output.clone(),
            ))
            .await?;
        for l in &self.listeners {
            l.on_run_finished(&meta.identifier, &output).await;
        }
        Ok(())
    }

    async fn finalize_failure(
        &self,
        function: &Function,
        meta: &RunMetadata,
        error: Value,
        status: RunStatus,
    ) -> Result<()> {
        let run_id = meta.identifier.run_id;
        self.state.finalize(run_id, status, ids::now_ms()).await?;
        self.sweep_pauses(run_id).await?;
        self.sink
            .send(event::function_failed(
                function.id,
                run_id,
                meta.correlation_id.as_deref(),
                error.clone(),
            ))
            .await?;
        for l in &self.listeners {
            l.on_run_failed(&meta.identifier, &error).await;
        }
        Ok(())
    }
}
