// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event intake: trigger matching, scheduling gates and pause resolution.
//!
//! Every ingested event flows through the same pipeline. First it resolves
//! pauses (invoke correlations, waited-for events, cancel triggers), then it
//! is matched against registered function triggers. A matched function routes
//! to its batch or debounce when configured, otherwise a run is scheduled
//! immediately behind the rate-limit, idempotency and priority gates.
//!
//! The runner also consumes the queue items those paths plant: `ScheduleBatch`
//! flushes a timed-out batch and `Debounce` starts the quiet-period run.

use chrono::{DateTime, Utc};
use croner::Cron;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use strand_expr::{Aggregator, Evaluator};

use crate::batch::BatchStore;
use crate::debounce::Debouncer;
use crate::error::{EngineError, Result};
use crate::event::{self, Event, TrackedEvent};
use crate::executor::EventSink;
use crate::function::{key_expression_hash, ConcurrencyScope, Function, FunctionLoader, Priority};
use crate::ids;
use crate::lifecycle::LifecycleListener;
use crate::pauses::{Pause, PauseStore};
use crate::queue::{ConcurrencyKey, ItemKind, LeaseId, Queue, QueueItem};
use crate::ratelimit::RateLimiter;
use crate::state::{RunIdentifier, RunMetadata, RunStatus, StateStore};

/// Trigger event name for cron schedules.
pub const CRON_EVENT: &str = "strand/scheduled.timer";

/// Lifetime of a cancel-trigger pause. Effectively "until the run ends".
const CANCEL_PAUSE_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Event intake and run scheduling.
pub struct Runner {
    queue: Arc<dyn Queue>,
    state: Arc<dyn StateStore>,
    pauses: Arc<dyn PauseStore>,
    batches: Arc<dyn BatchStore>,
    debouncer: Debouncer,
    loader: Arc<dyn FunctionLoader>,
    limiter: Arc<dyn RateLimiter>,
    evaluator: Evaluator,
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

impl Runner {
    /// Wire a runner over its stores and gates.
    pub fn new(
        queue: Arc<dyn Queue>,
        state: Arc<dyn StateStore>,
        pauses: Arc<dyn PauseStore>,
        batches: Arc<dyn BatchStore>,
        debouncer: Debouncer,
        loader: Arc<dyn FunctionLoader>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            queue,
            state,
            pauses,
            batches,
            debouncer,
            loader,
            limiter,
            evaluator: Evaluator::new(),
            listeners: Vec::new(),
        }
    }

    /// Register a lifecycle listener.
    pub fn add_listener(&mut self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.push(listener);
    }

    /// Ingest one tracked event: resolve pauses, match triggers and schedule
    /// runs. Returns the IDs of runs scheduled for this event.
    #[tracing::instrument(skip_all, fields(event = %tracked.event.name))]
    pub async fn ingest(&self, tracked: &TrackedEvent) -> Result<Vec<Uuid>> {
        tracked.event.validate()?;
        self.resolve_pauses(tracked).await?;

        let mut scheduled = Vec::new();

        // Invoke events target one function directly, bypassing triggers.
        if tracked.event.name == event::FN_INVOKED {
            if let Some(run_id) = self.schedule_invoke_target(tracked).await? {
                scheduled.push(run_id);
            }
            return Ok(scheduled);
        }

        if tracked.event.name == event::FN_FAILED {
            scheduled.extend(self.schedule_failure_handler(tracked).await?);
        }

        for function in self.matching_functions(&tracked.event) {
            if let Some(cfg) = function.batch.clone() {
                let key = self.eval_key(cfg.key.as_deref(), &tracked.event);
                scheduled.extend(self.append_to_batch(&function, &cfg, &key, tracked).await?);
                continue;
            }
            if let Some(cfg) = function.debounce.clone() {
                let key = self.eval_key(cfg.key.as_deref(), &tracked.event);
                self.debouncer.observe(&function, &cfg, &key, tracked).await?;
                continue;
            }
            if let Some(run_id) = self
                .schedule(&function, std::slice::from_ref(tracked), None, ids::now_ms(), None)
                .await?
            {
                scheduled.push(run_id);
            }
        }
        Ok(scheduled)
    }

    /// Deliver a named signal to its waiting pause, if any. Returns whether a
    /// pause was resumed.
    pub async fn deliver_signal(&self, signal: &str, payload: Value) -> Result<bool> {
        let Some(pause) = self.pauses.pause_by_signal(signal).await? else {
            return Ok(false);
        };
        self.try_resume(&pause, payload).await
    }

    /// Process a leased runner item (`ScheduleBatch` or `Debounce`).
    #[tracing::instrument(skip_all, fields(item = %item.id, kind = ?item.kind))]
    pub async fn process(&self, item: &QueueItem, lease: LeaseId) -> Result<()> {
        match item.kind {
            ItemKind::ScheduleBatch => self.handle_schedule_batch(item, lease).await,
            ItemKind::Debounce => self.handle_debounce(item, lease).await,
            other => {
                tracing::warn!(kind = ?other, "unroutable item kind reached the runner");
                self.queue.dequeue(&item.id, lease).await
            }
        }
    }

    /// Schedule runs for cron triggers due within `horizon` of `now_ms`.
    /// Deterministic idempotency keys make overlapping ticks and competing
    /// instances safe.
    pub async fn tick_cron(&self, now_ms: u64, horizon: Duration) -> Result<Vec<Uuid>> {
        let mut scheduled = Vec::new();
        let Some(from) = DateTime::<Utc>::from_timestamp_millis(now_ms as i64) else {
            return Ok(scheduled);
        };
        for function in self.loader.functions_with_cron() {
            for pattern in function.cron_triggers() {
                let cron = match Cron::new(pattern).parse() {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(function = %function.slug, pattern, error = %e, "invalid cron pattern");
                        continue;
                    }
                };
                let Ok(next) = cron.find_next_occurrence(&from, true) else { continue };
                let next_ms = next.timestamp_millis() as u64;
                if next_ms >= now_ms + horizon.as_millis() as u64 {
                    continue;
                }
                let tracked = TrackedEvent::seeded(
                    Event {
                        id: String::new(),
                        name: CRON_EVENT.to_string(),
                        data: json!({ "cron": pattern }),
                        user: Value::Null,
                        ts: next_ms as i64,
                        v: String::new(),
                    },
                    next_ms,
                    function.id.as_bytes(),
                );
                let idem = format!("cron:{}:{next_ms}", function.id);
                if let Some(run_id) = self
                    .schedule(
                        &function,
                        std::slice::from_ref(&tracked),
                        None,
                        next_ms,
                        Some(idem),
                    )
                    .await?
                {
                    scheduled.push(run_id);
                }
            }
        }
        Ok(scheduled)
    }

    // ---- pause resolution ----

    async fn resolve_pauses(&self, tracked: &TrackedEvent) -> Result<()> {
        // Only the child's completion settles an invoke pause. The invoked
        // trigger event carries the same correlation ID and must not consume
        // the parent's pause on its way in.
        if matches!(tracked.event.name.as_str(), event::FN_FINISHED | event::FN_FAILED) {
            if let Some(corr) = tracked.event.correlation_id() {
                if let Some(pause) = self.pauses.pause_by_correlation(corr).await? {
                    let data = invoke_resume_data(&tracked.event);
                    self.try_resume(&pause, data).await?;
                }
            }
        }

        for pause in self.pauses.pauses_by_event(&tracked.event.name).await? {
            if let Some(expr) = &pause.expression {
                let scope = self.pause_scope(&pause, tracked).await;
                match self.evaluator.matches(expr, &scope) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        tracing::warn!(pause = %pause.id, error = %e, "pause expression failed");
                        continue;
                    }
                }
            }
            self.try_resume(&pause, tracked.event.map()).await?;
        }
        Ok(())
    }

    /// Scope for pause-match expressions: `event` is the run's first trigger
    /// event, `async` the incoming candidate.
    async fn pause_scope(&self, pause: &Pause, candidate: &TrackedEvent) -> Value {
        let original = self
            .state
            .load_events(pause.identifier.run_id)
            .await
            .ok()
            .and_then(|events| events.into_iter().next())
            .map(|t| t.event.map())
            .unwrap_or(Value::Null);
        json!({ "event": original, "async": candidate.event.map() })
    }

    /// Lease, consume and resume one pause. Losing the race to another
    /// matcher is not an error.
    async fn try_resume(&self, pause: &Pause, data: Value) -> Result<bool> {
        match self.pauses.lease(pause.id, ids::now_ms()).await {
            Ok(()) => {}
            Err(
                EngineError::AlreadyLeased(_)
                | EngineError::PauseConsumed(_)
                | EngineError::PauseNotFound(_),
            ) => return Ok(false),
            Err(e) => return Err(e),
        }
        match self.pauses.consume(pause.id, &data).await {
            Ok(()) => {}
            Err(EngineError::PauseConsumed(_) | EngineError::PauseNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        }
        self.resume_pause(pause, data).await?;
        Ok(true)
    }

    /// Apply a consumed pause: either cancel the run or memoize the step and
    /// enqueue the continuation. Mirrors the executor's timeout path; both
    /// use the same deterministic item IDs so a crashed winner and the
    /// timeout item converge on one continuation.
    async fn resume_pause(&self, pause: &Pause, data: Value) -> Result<()> {
        let run_id = pause.identifier.run_id;
        if pause.cancel {
            let cancel = QueueItem {
                id: format!("cancel:{}", pause.id),
                job_id: format!("run:{run_id}"),
                kind: ItemKind::Cancel,
                function_id: pause.identifier.function_id,
                run_id: Some(run_id),
                attempt: 0,
                max_attempts: 1,
                at_ms: ids::now_ms(),
                payload: Value::Null,
                concurrency: Vec::new(),
            };
            match self.queue.enqueue(&cancel).await {
                Ok(()) | Err(EngineError::Duplicate(_)) => {}
                Err(e) => return Err(e),
            }
        } else {
            let meta = self.state.load_run(run_id).await?;
            if !meta.status.is_terminal() {
                match self.state.save_step(run_id, &pause.step_id, &data).await {
                    Ok(()) => {}
                    Err(e) if e.is_idempotent_duplicate() => {}
                    Err(e) => return Err(e),
                }
                let max_attempts = self
                    .loader
                    .function(pause.identifier.function_id)
                    .map(|f| f.max_attempts())
                    .unwrap_or(crate::function::DEFAULT_MAX_ATTEMPTS);
                let edge = QueueItem {
                    id: format!("run:{run_id}:resume:{}", pause.id),
                    job_id: format!("run:{run_id}"),
                    kind: ItemKind::Edge,
                    function_id: pause.identifier.function_id,
                    run_id: Some(run_id),
                    attempt: 0,
                    max_attempts,
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
        }

        if !pause.timeout_item_id.is_empty() {
            match self
                .queue
                .remove(
                    &pause.identifier.function_id.to_string(),
                    &pause.timeout_item_id,
                    ids::now_ms(),
                )
                .await
            {
                Ok(()) | Err(EngineError::AlreadyLeased(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.pauses.delete(pause.id).await
    }

    // ---- trigger matching ----

    /// Functions whose triggers match this event. Expression triggers are
    /// matched through the aggregator so many predicates probe the event in
    /// one pass.
    fn matching_functions(&self, event: &Event) -> Vec<Function> {
        let candidates = self.loader.functions_by_event(&event.name);
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut aggregator = Aggregator::new();
        let mut predicate_owner: HashMap<u64, usize> = HashMap::new();
        let mut unconditional = vec![false; candidates.len()];
        let mut next_id = 0u64;
        for (idx, function) in candidates.iter().enumerate() {
            for (name, expression) in function.event_triggers() {
                if name != event.name {
                    continue;
                }
                match expression {
                    None => unconditional[idx] = true,
                    Some(expr) => {
                        if let Err(e) = aggregator.add(next_id, expr) {
                            tracing::warn!(function = %function.slug, error = %e, "invalid trigger expression");
                        } else {
                            predicate_owner.insert(next_id, idx);
                            next_id += 1;
                        }
                    }
                }
            }
        }

        let mut matched = unconditional;
        if !aggregator.is_empty() {
            let scope = event.scope();
            for id in aggregator.matches(&scope, |id, e| {
                tracing::warn!(predicate = id, error = %e, "trigger expression failed");
            }) {
                if let Some(&idx) = predicate_owner.get(&id) {
                    matched[idx] = true;
                }
            }
        }

        candidates
            .into_iter()
            .zip(matched)
            .filter_map(|(f, hit)| hit.then_some(f))
            .collect()
    }

    // ---- invoke and failure handling ----

    async fn schedule_invoke_target(&self, tracked: &TrackedEvent) -> Result<Option<Uuid>> {
        let Some(target) = tracked
            .event
            .data
            .get("function_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            tracing::warn!("invoke event without a target function id");
            return Ok(None);
        };
        let Some(function) = self.loader.function(target) else {
            tracing::warn!(function_id = %target, "invoke target not registered");
            return Ok(None);
        };
        let correlation = tracked.event.correlation_id().map(String::from);
        self.schedule(&function, std::slice::from_ref(tracked), correlation, ids::now_ms(), None)
            .await
    }

    /// Run a failed function's `on_failure` handler with the failure event.
    async fn schedule_failure_handler(&self, tracked: &TrackedEvent) -> Result<Vec<Uuid>> {
        let Some(failed_id) = tracked
            .event
            .data
            .get("function_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            return Ok(Vec::new());
        };
        let Some(failed) = self.loader.function(failed_id) else {
            return Ok(Vec::new());
        };
        let Some(slug) = &failed.on_failure else {
            return Ok(Vec::new());
        };
        let target_id = Function::derive_id(failed.app_id, slug);
        let Some(handler) = self.loader.function(target_id) else {
            tracing::warn!(slug = %slug, "on_failure handler not registered");
            return Ok(Vec::new());
        };
        let run_id = self
            .schedule(&handler, std::slice::from_ref(tracked), None, ids::now_ms(), None)
            .await?;
        Ok(run_id.into_iter().collect())
    }

    // ---- batch and debounce items ----

    async fn append_to_batch(
        &self,
        function: &Function,
        cfg: &crate::function::Batch,
        key: &str,
        tracked: &TrackedEvent,
    ) -> Result<Vec<Uuid>> {
        let appended = self.batches.append(function.id, key, tracked, cfg.max_size).await?;
        if appended.full {
            // The append claimed the batch atomically; flush inline.
            let events = self.batches.events(appended.batch_id).await?;
            let run_id =
                self.schedule(function, &events, None, ids::now_ms(), None).await?;
            self.batches.delete(appended.batch_id).await?;
            // The timeout item is now a no-op; drop it if nothing holds it.
            match self
                .queue
                .remove(
                    &function.id.to_string(),
                    &format!("batch:{}", appended.batch_id),
                    ids::now_ms(),
                )
                .await
            {
                Ok(()) | Err(EngineError::AlreadyLeased(_)) => {}
                Err(e) => return Err(e),
            }
            return Ok(run_id.into_iter().collect());
        }
        if appended.created {
            let item = QueueItem {
                id: format!("batch:{}", appended.batch_id),
                job_id: format!("batch:{}", appended.batch_id),
                kind: ItemKind::ScheduleBatch,
                function_id: function.id,
                run_id: None,
                attempt: 0,
                max_attempts: 1,
                at_ms: ids::now_ms() + cfg.timeout_secs * 1000,
                payload: json!({ "batch_id": appended.batch_id, "key": key }),
                concurrency: Vec::new(),
            };
            match self.queue.enqueue(&item).await {
                Ok(()) | Err(EngineError::Duplicate(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(Vec::new())
    }

    async fn handle_schedule_batch(&self, item: &QueueItem, lease: LeaseId) -> Result<()> {
        let batch_id = item
            .payload
            .get("batch_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        let key = item.payload.get("key").and_then(Value::as_str).unwrap_or_default();
        let (Some(batch_id), Some(function)) = (batch_id, self.loader.function(item.function_id))
        else {
            return self.queue.dequeue(&item.id, lease).await;
        };

        match self.batches.claim(function.id, key, batch_id).await {
            Ok(()) => {
                let events = self.batches.events(batch_id).await?;
                if !events.is_empty() {
                    self.schedule(&function, &events, None, ids::now_ms(), None).await?;
                }
                self.batches.delete(batch_id).await?;
            }
            // Already flushed by the full-size path.
            Err(EngineError::BatchNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.queue.dequeue(&item.id, lease).await
    }

    async fn handle_debounce(&self, item: &QueueItem, lease: LeaseId) -> Result<()> {
        let debounce_id = item
            .payload
            .get("debounce_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        let key = item.payload.get("key").and_then(Value::as_str).unwrap_or_default();
        let (Some(debounce_id), Some(function)) =
            (debounce_id, self.loader.function(item.function_id))
        else {
            return self.queue.dequeue(&item.id, lease).await;
        };

        match self.debouncer.start(debounce_id).await {
            Ok(tracked) => {
                self.schedule(&function, std::slice::from_ref(&tracked), None, ids::now_ms(), None)
                    .await?;
                self.debouncer.finish(function.id, key, debounce_id).await?;
            }
            Err(EngineError::DebounceNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.queue.dequeue(&item.id, lease).await
    }

    // ---- scheduling ----

    /// Schedule one run behind the rate-limit, idempotency and priority
    /// gates. Returns `None` when a gate dropped or deduplicated it.
    async fn schedule(
        &self,
        function: &Function,
        events: &[TrackedEvent],
        correlation: Option<String>,
        at_ms: u64,
        forced_idempotency: Option<String>,
    ) -> Result<Option<Uuid>> {
        let Some(first) = events.first() else { return Ok(None) };
        let scope = first.event.scope();

        if let Some(rl) = &function.rate_limit {
            let val = self.eval_key(rl.key.as_deref(), &first.event);
            let key = format!("rl:{}:{val}", function.id);
            match self
                .limiter
                .admit(&key, rl.limit, Duration::from_secs(rl.period_secs), ids::now_ms())
                .await
            {
                Ok(()) => {}
                Err(EngineError::RateLimited(_)) => {
                    tracing::debug!(function = %function.slug, "run creation rate limited");
                    self.record_skipped(function, events).await?;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }

        // Throttle smooths run starts instead of dropping them: a full window
        // pushes the start to the next window boundary.
        let mut at_ms = at_ms;
        if let Some(th) = &function.throttle {
            let val = self.eval_key(th.key.as_deref(), &first.event);
            let key = format!("th:{}:{val}", function.id);
            let period = Duration::from_secs(th.period_secs);
            match self.limiter.admit(&key, th.limit, period, ids::now_ms()).await {
                Ok(()) => {}
                Err(EngineError::RateLimited(_)) => {
                    let period_ms = period.as_millis() as u64;
                    let now = ids::now_ms();
                    at_ms = at_ms.max(now - now % period_ms.max(1) + period_ms);
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(priority) = &function.priority {
            at_ms = self.apply_priority(priority, &scope, at_ms);
        }

        let idempotency_key = forced_idempotency.or_else(|| {
            function.idempotency.as_ref().map(|expr| {
                format!("{}:{}", function.id, self.eval_value_string(expr, &scope))
            })
        });

        let run_id = ids::new_id();
        let identifier =
            RunIdentifier { run_id, function_id: function.id, function_version: function.version };
        let mut metadata =
            RunMetadata::new(identifier, events.iter().map(|t| t.internal_id).collect());
        metadata.correlation_id = correlation;

        match self.state.create_run(&metadata, events, idempotency_key.as_deref()).await {
            Ok(()) => {}
            Err(EngineError::RunExists(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        for cancel in &function.cancel_on {
            let pause = Pause {
                id: ids::new_id(),
                identifier,
                step_id: String::new(),
                event: Some(cancel.event.clone()),
                expression: cancel.if_expression.clone(),
                correlation_id: None,
                signal: None,
                expires_at_ms: ids::now_ms() + CANCEL_PAUSE_TTL.as_millis() as u64,
                timeout_item_id: String::new(),
                cancel: true,
            };
            self.pauses.save(&pause).await?;
        }

        let start = QueueItem {
            id: format!("run:{run_id}:start"),
            job_id: format!("run:{run_id}"),
            kind: ItemKind::Start,
            function_id: function.id,
            run_id: Some(run_id),
            attempt: 0,
            max_attempts: function.max_attempts(),
            at_ms,
            payload: Value::Null,
            concurrency: self.concurrency_gates(function, &scope),
        };
        self.queue.enqueue(&start).await?;

        for l in &self.listeners {
            l.on_run_scheduled(&identifier).await;
        }
        tracing::debug!(run_id = %run_id, function = %function.slug, "run scheduled");
        Ok(Some(run_id))
    }

    /// Record a gate-dropped run as `Skipped` so the decision stays
    /// inspectable. No queue item is planted and no dispatch ever happens.
    async fn record_skipped(&self, function: &Function, events: &[TrackedEvent]) -> Result<()> {
        let identifier = RunIdentifier {
            run_id: ids::new_id(),
            function_id: function.id,
            function_version: function.version,
        };
        let mut metadata =
            RunMetadata::new(identifier, events.iter().map(|t| t.internal_id).collect());
        metadata.status = RunStatus::Skipped;
        metadata.ended_at_ms = Some(ids::now_ms());
        match self.state.create_run(&metadata, events, None).await {
            Ok(()) | Err(EngineError::RunExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Priority factor in seconds, positive factors schedule earlier.
    fn apply_priority(&self, priority: &Priority, scope: &Value, at_ms: u64) -> u64 {
        let factor = match self.evaluator.value(&priority.run, scope) {
            Ok(v) => v.as_i64().unwrap_or(0),
            Err(e) => {
                tracing::warn!(error = %e, "priority expression failed");
                0
            }
        };
        let factor = factor.clamp(-Priority::MAX_FACTOR_SECS, Priority::MAX_FACTOR_SECS);
        if factor >= 0 {
            at_ms.saturating_sub(factor as u64 * 1000)
        } else {
            at_ms + factor.unsigned_abs() * 1000
        }
    }

    fn concurrency_gates(&self, function: &Function, scope: &Value) -> Vec<ConcurrencyKey> {
        function
            .concurrency
            .iter()
            .map(|c| {
                let (val, hash) = match &c.key {
                    Some(expr) => {
                        (self.eval_value_string(expr, scope), key_expression_hash(expr))
                    }
                    None => (String::new(), String::new()),
                };
                let key = match c.scope {
                    ConcurrencyScope::Function => format!("f:{}:{val}", function.id),
                    ConcurrencyScope::Account => format!("a:{val}"),
                };
                ConcurrencyKey { scope: c.scope, key, expression_hash: hash, limit: c.limit }
            })
            .collect()
    }

    /// Evaluate an optional key expression over an event; `None` and failed
    /// expressions key to the empty string.
    fn eval_key(&self, expression: Option<&str>, event: &Event) -> String {
        match expression {
            Some(expr) => self.eval_value_string(expr, &event.scope()),
            None => String::new(),
        }
    }

    fn eval_value_string(&self, expression: &str, scope: &Value) -> String {
        match self.evaluator.value(expression, scope) {
            Ok(Value::String(s)) => s,
            Ok(Value::Null) => String::new(),
            Ok(other) => other.to_string(),
            Err(e) => {
                tracing::warn!(expression, error = %e, "key expression failed");
                String::new()
            }
        }
    }
}

/// Resume data for an invoke pause: the child's result on success, its error
/// on failure.
fn invoke_resume_data(event: &Event) -> Value {
    if event.name == event::FN_FAILED {
        json!({ "error": event.data.get("error").cloned().unwrap_or(Value::Null) })
    } else {
        event.data.get("result").cloned().unwrap_or(Value::Null)
    }
}

#[async_trait::async_trait]
impl EventSink for Runner {
    async fn send(&self, event: Event) -> Result<()> {
        let tracked = TrackedEvent::new(event);
        self.ingest(&tracked).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::MemoryBatchStore;
    use crate::debounce::MemoryDebounceStore;
    use crate::function::{Batch, CancelOn, Concurrency, Debounce, RateLimit, Trigger};
    use crate::pauses::MemoryPauseStore;
    use crate::queue::MemoryQueue;
    use crate::ratelimit::MemoryRateLimiter;
    use crate::state::{MemoryStateStore, RunStatus, StateLimits};

    struct MapLoader(HashMap<Uuid, Function>);

    impl FunctionLoader for MapLoader {
        fn function(&self, id: Uuid) -> Option<Function> {
            self.0.get(&id).cloned()
        }

        fn functions_by_event(&self, event_name: &str) -> Vec<Function> {
            let mut out: Vec<Function> = self
                .0
                .values()
                .filter(|f| f.event_triggers().any(|(e, _)| e == event_name))
                .cloned()
                .collect();
            out.sort_by_key(|f| f.slug.clone());
            out
        }

        fn functions_with_cron(&self) -> Vec<Function> {
            self.0
                .values()
                .filter(|f| f.cron_triggers().next().is_some())
                .cloned()
                .collect()
        }
    }

    struct Harness {
        queue: Arc<MemoryQueue>,
        state: Arc<MemoryStateStore>,
        pauses: Arc<MemoryPauseStore>,
        runner: Runner,
    }

    fn function(slug: &str, trigger_event: &str) -> Function {
        let app_id = Function::derive_app_id("http://localhost:3000/api/strand");
        Function {
            id: Function::derive_id(app_id, slug),
            app_id,
            slug: slug.to_string(),
            name: String::new(),
            version: 1,
            url: "http://localhost:3000/api/strand".to_string(),
            triggers: vec![Trigger::Event {
                event: trigger_event.to_string(),
                expression: None,
            }],
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

    fn harness(functions: Vec<Function>) -> Harness {
        let queue = Arc::new(MemoryQueue::default());
        let state = Arc::new(MemoryStateStore::new(StateLimits::default()));
        let pauses = Arc::new(MemoryPauseStore::new());
        let batches = Arc::new(MemoryBatchStore::new());
        let debouncer =
            Debouncer::new(Arc::new(MemoryDebounceStore::new()), queue.clone());
        let loader =
            Arc::new(MapLoader(functions.into_iter().map(|f| (f.id, f)).collect()));
        let runner = Runner::new(
            queue.clone(),
            state.clone(),
            pauses.clone(),
            batches,
            debouncer,
            loader,
            Arc::new(MemoryRateLimiter::new()),
        );
        Harness { queue, state, pauses, runner }
    }

    fn tracked(name: &str, data: Value) -> TrackedEvent {
        TrackedEvent::new(Event {
            id: String::new(),
            name: name.to_string(),
            data,
            user: Value::Null,
            ts: 0,
            v: String::new(),
        })
    }

    async fn items(h: &Harness, function_id: Uuid) -> Vec<QueueItem> {
        h.queue
            .peek(&function_id.to_string(), u64::MAX / 2, 100)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_trigger_match_schedules_run() {
        let f = function("orders", "order/created");
        let h = harness(vec![f.clone()]);

        let runs = h.runner.ingest(&tracked("order/created", json!({"n": 1}))).await.unwrap();
        assert_eq!(runs.len(), 1);

        let meta = h.state.load_run(runs[0]).await.unwrap();
        assert_eq!(meta.status, RunStatus::Scheduled);
        let queued = items(&h, f.id).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, ItemKind::Start);
        assert_eq!(queued[0].run_id, Some(runs[0]));
    }

    #[tokio::test]
    async fn test_trigger_expression_filters() {
        let mut f = function("big-orders", "order/created");
        f.triggers = vec![Trigger::Event {
            event: "order/created".to_string(),
            expression: Some("event.data.amount >= 100".to_string()),
        }];
        let h = harness(vec![f]);

        let none = h
            .runner
            .ingest(&tracked("order/created", json!({"amount": 5})))
            .await
            .unwrap();
        assert!(none.is_empty());

        let some = h
            .runner
            .ingest(&tracked("order/created", json!({"amount": 250})))
            .await
            .unwrap();
        assert_eq!(some.len(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_event_schedules_nothing() {
        let h = harness(vec![function("orders", "order/created")]);
        let runs = h.runner.ingest(&tracked("user/login", json!({}))).await.unwrap();
        assert!(runs.is_empty());
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn test_invoke_event_targets_function_with_correlation() {
        let f = function("child", "never/fired");
        let h = harness(vec![f.clone()]);

        let invoke = TrackedEvent::new(event::function_invoked(
            f.id,
            "parent-run.step-1",
            json!({"x": 1}),
        ));
        let runs = h.runner.ingest(&invoke).await.unwrap();
        assert_eq!(runs.len(), 1);
        let meta = h.state.load_run(runs[0]).await.unwrap();
        assert_eq!(meta.correlation_id.as_deref(), Some("parent-run.step-1"));
    }

    #[tokio::test]
    async fn test_finished_event_resumes_correlation_pause() {
        let f = function("parent", "never/fired");
        let h = harness(vec![f.clone()]);

        // Seed a paused parent run waiting on an invoke.
        let run_id = ids::new_id();
        let identifier = RunIdentifier { run_id, function_id: f.id, function_version: 1 };
        let trigger = tracked("order/created", json!({}));
        h.state
            .create_run(
                &RunMetadata::new(identifier, vec![trigger.internal_id]),
                std::slice::from_ref(&trigger),
                None,
            )
            .await
            .unwrap();
        let pause = Pause {
            id: ids::new_id(),
            identifier,
            step_id: "call-child".to_string(),
            event: None,
            expression: None,
            correlation_id: Some(format!("{run_id}.call-child")),
            signal: None,
            expires_at_ms: ids::now_ms() + 60_000,
            timeout_item_id: String::new(),
            cancel: false,
        };
        h.pauses.save(&pause).await.unwrap();

        let finished = TrackedEvent::new(event::function_finished(
            Uuid::new_v4(),
            ids::new_id(),
            Some(&format!("{run_id}.call-child")),
            json!({"total": 7}),
        ));
        h.runner.ingest(&finished).await.unwrap();

        // The child's result was memoized and the continuation enqueued.
        let steps = h.state.steps(run_id).await.unwrap();
        assert_eq!(steps["call-child"]["total"], 7);
        let queued = items(&h, f.id).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, ItemKind::Edge);
        assert!(h.pauses.pause_by_correlation(&format!("{run_id}.call-child")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invoked_event_does_not_consume_correlation_pause() {
        let f = function("parent", "never/fired");
        let h = harness(vec![f.clone()]);

        let run_id = ids::new_id();
        let identifier = RunIdentifier { run_id, function_id: f.id, function_version: 1 };
        let trigger = tracked("order/created", json!({}));
        h.state
            .create_run(
                &RunMetadata::new(identifier, vec![trigger.internal_id]),
                std::slice::from_ref(&trigger),
                None,
            )
            .await
            .unwrap();
        let corr = format!("{run_id}.call-child");
        let pause = Pause {
            id: ids::new_id(),
            identifier,
            step_id: "call-child".to_string(),
            event: None,
            expression: None,
            correlation_id: Some(corr.clone()),
            signal: None,
            expires_at_ms: ids::now_ms() + 60_000,
            timeout_item_id: String::new(),
            cancel: false,
        };
        h.pauses.save(&pause).await.unwrap();

        // The child's trigger event carries the parent's correlation ID; it
        // must leave the pause intact for the child's completion to settle.
        let invoked =
            TrackedEvent::new(event::function_invoked(Uuid::new_v4(), &corr, json!({"a": 1})));
        h.runner.ingest(&invoked).await.unwrap();

        assert!(h.pauses.pause_by_correlation(&corr).await.unwrap().is_some());
        assert!(h.state.steps(run_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_pause_resumed_with_expression() {
        let f = function("waiter", "never/fired");
        let h = harness(vec![f.clone()]);

        let run_id = ids::new_id();
        let identifier = RunIdentifier { run_id, function_id: f.id, function_version: 1 };
        let trigger = tracked("order/created", json!({"order_id": 42}));
        h.state
            .create_run(
                &RunMetadata::new(identifier, vec![trigger.internal_id]),
                std::slice::from_ref(&trigger),
                None,
            )
            .await
            .unwrap();
        let pause = Pause {
            id: ids::new_id(),
            identifier,
            step_id: "wait-payment".to_string(),
            event: Some("payment/settled".to_string()),
            expression: Some("async.data.order_id == event.data.order_id".to_string()),
            correlation_id: None,
            signal: None,
            expires_at_ms: ids::now_ms() + 60_000,
            timeout_item_id: String::new(),
            cancel: false,
        };
        h.pauses.save(&pause).await.unwrap();

        // Wrong order ID does not resume.
        h.runner
            .ingest(&tracked("payment/settled", json!({"order_id": 99})))
            .await
            .unwrap();
        assert_eq!(h.pauses.pauses_by_event("payment/settled").await.unwrap().len(), 1);

        // Matching one does.
        h.runner
            .ingest(&tracked("payment/settled", json!({"order_id": 42})))
            .await
            .unwrap();
        assert!(h.pauses.pauses_by_event("payment/settled").await.unwrap().is_empty());
        let steps = h.state.steps(run_id).await.unwrap();
        assert_eq!(steps["wait-payment"]["data"]["order_id"], 42);
    }

    #[tokio::test]
    async fn test_cancel_on_creates_pause_and_cancel_item() {
        let mut f = function("cancellable", "job/started");
        f.cancel_on = vec![CancelOn { event: "job/aborted".to_string(), if_expression: None }];
        let h = harness(vec![f.clone()]);

        let runs = h.runner.ingest(&tracked("job/started", json!({}))).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(h.pauses.pauses_by_event("job/aborted").await.unwrap().len(), 1);

        h.runner.ingest(&tracked("job/aborted", json!({}))).await.unwrap();
        let queued = items(&h, f.id).await;
        assert!(queued.iter().any(|i| i.kind == ItemKind::Cancel));
    }

    #[tokio::test]
    async fn test_batch_accumulates_then_flushes_on_size() {
        let mut f = function("batched", "metric/point");
        f.batch = Some(Batch { max_size: 3, timeout_secs: 60, key: None });
        let h = harness(vec![f.clone()]);

        assert!(h.runner.ingest(&tracked("metric/point", json!({"n": 1}))).await.unwrap().is_empty());
        assert!(h.runner.ingest(&tracked("metric/point", json!({"n": 2}))).await.unwrap().is_empty());
        let runs = h.runner.ingest(&tracked("metric/point", json!({"n": 3}))).await.unwrap();
        assert_eq!(runs.len(), 1);

        let events = h.state.load_events(runs[0]).await.unwrap();
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_batch_timeout_item_flushes_partial() {
        let mut f = function("batched", "metric/point");
        f.batch = Some(Batch { max_size: 100, timeout_secs: 1, key: None });
        let h = harness(vec![f.clone()]);

        h.runner.ingest(&tracked("metric/point", json!({"n": 1}))).await.unwrap();
        h.runner.ingest(&tracked("metric/point", json!({"n": 2}))).await.unwrap();

        let queued = items(&h, f.id).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, ItemKind::ScheduleBatch);

        let lease = h
            .queue
            .lease(&queued[0].id, Duration::from_secs(20), queued[0].at_ms + 1)
            .await
            .unwrap();
        h.runner.process(&queued[0], lease).await.unwrap();

        let queued = items(&h, f.id).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, ItemKind::Start);
        let events = h.state.load_events(queued[0].run_id.unwrap()).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_debounce_item_starts_latest_event() {
        let mut f = function("debounced", "doc/edited");
        f.debounce = Some(Debounce { period_secs: 5, timeout_secs: None, key: None });
        let h = harness(vec![f.clone()]);

        h.runner.ingest(&tracked("doc/edited", json!({"rev": 1}))).await.unwrap();
        h.runner.ingest(&tracked("doc/edited", json!({"rev": 2}))).await.unwrap();

        let queued = items(&h, f.id).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, ItemKind::Debounce);

        let lease = h
            .queue
            .lease(&queued[0].id, Duration::from_secs(20), queued[0].at_ms + 1)
            .await
            .unwrap();
        h.runner.process(&queued[0], lease).await.unwrap();

        let queued = items(&h, f.id).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, ItemKind::Start);
        let events = h.state.load_events(queued[0].run_id.unwrap()).await.unwrap();
        assert_eq!(events[0].event.data["rev"], 2);
    }

    #[tokio::test]
    async fn test_rate_limit_drops_excess_runs() {
        let mut f = function("limited", "ping");
        f.rate_limit = Some(RateLimit { limit: 2, period_secs: 60, key: None });
        let h = harness(vec![f]);

        let mut total = 0;
        for _ in 0..5 {
            total += h.runner.ingest(&tracked("ping", json!({}))).await.unwrap().len();
        }
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_rate_limited_runs_recorded_as_skipped() {
        let mut f = function("limited", "ping");
        f.rate_limit = Some(RateLimit { limit: 1, period_secs: 60, key: None });
        let h = harness(vec![f.clone()]);

        let first = h.runner.ingest(&tracked("ping", json!({}))).await.unwrap();
        let second = h.runner.ingest(&tracked("ping", json!({}))).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());

        // The dropped run leaves a terminal Skipped record but no queue item.
        assert_eq!(h.state.run_count(), 2);
        let queued = items(&h, f.id).await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].run_id, Some(first[0]));
    }

    #[tokio::test]
    async fn test_idempotency_key_dedupes_runs() {
        let mut f = function("idem", "order/created");
        f.idempotency = Some("event.data.order_id".to_string());
        let h = harness(vec![f]);

        let first = h
            .runner
            .ingest(&tracked("order/created", json!({"order_id": "A-1"})))
            .await
            .unwrap();
        let second = h
            .runner
            .ingest(&tracked("order/created", json!({"order_id": "A-1"})))
            .await
            .unwrap();
        let third = h
            .runner
            .ingest(&tracked("order/created", json!({"order_id": "A-2"})))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(third.len(), 1);
    }

    #[tokio::test]
    async fn test_priority_schedules_earlier() {
        let mut f = function("prio", "job/new");
        f.priority = Some(Priority { run: "event.data.boost".to_string() });
        let h = harness(vec![f.clone()]);

        let before = ids::now_ms();
        h.runner.ingest(&tracked("job/new", json!({"boost": 120}))).await.unwrap();
        let queued = items(&h, f.id).await;
        assert!(queued[0].at_ms <= before - 119_000);
    }

    #[tokio::test]
    async fn test_concurrency_gates_frozen_on_start_item() {
        let mut f = function("gated", "order/created");
        f.concurrency = vec![Concurrency {
            limit: 2,
            scope: ConcurrencyScope::Function,
            key: Some("event.data.customer".to_string()),
        }];
        let h = harness(vec![f.clone()]);

        h.runner
            .ingest(&tracked("order/created", json!({"customer": "acme"})))
            .await
            .unwrap();
        let queued = items(&h, f.id).await;
        let gate = &queued[0].concurrency[0];
        assert_eq!(gate.key, format!("f:{}:acme", f.id));
        assert_eq!(gate.limit, 2);
        assert!(!gate.expression_hash.is_empty());
    }

    #[tokio::test]
    async fn test_signal_delivery_resumes_pause() {
        let f = function("signaled", "never/fired");
        let h = harness(vec![f.clone()]);

        let run_id = ids::new_id();
        let identifier = RunIdentifier { run_id, function_id: f.id, function_version: 1 };
        let trigger = tracked("job/started", json!({}));
        h.state
            .create_run(
                &RunMetadata::new(identifier, vec![trigger.internal_id]),
                std::slice::from_ref(&trigger),
                None,
            )
            .await
            .unwrap();
        let pause = Pause {
            id: ids::new_id(),
            identifier,
            step_id: "wait-signal".to_string(),
            event: None,
            expression: None,
            correlation_id: None,
            signal: Some("deploy-approved".to_string()),
            expires_at_ms: ids::now_ms() + 60_000,
            timeout_item_id: String::new(),
            cancel: false,
        };
        h.pauses.save(&pause).await.unwrap();

        assert!(!h.runner.deliver_signal("other", json!({})).await.unwrap());
        assert!(h.runner.deliver_signal("deploy-approved", json!({"by": "ops"})).await.unwrap());
        let steps = h.state.steps(run_id).await.unwrap();
        assert_eq!(steps["wait-signal"]["by"], "ops");
    }

    #[tokio::test]
    async fn test_cron_tick_is_idempotent() {
        let app_id = Function::derive_app_id("http://localhost:3000/api/strand");
        let mut f = function("nightly", "never/fired");
        f.id = Function::derive_id(app_id, "nightly");
        f.triggers = vec![Trigger::Cron { cron: "* * * * *".to_string() }];
        let h = harness(vec![f.clone()]);

        let now = ids::now_ms();
        let first = h.runner.tick_cron(now, Duration::from_secs(120)).await.unwrap();
        assert_eq!(first.len(), 1);
        // A second overlapping tick schedules nothing new.
        let second = h.runner.tick_cron(now, Duration::from_secs(120)).await.unwrap();
        assert!(second.is_empty());

        let events = h.state.load_events(first[0]).await.unwrap();
        assert_eq!(events[0].event.name, CRON_EVENT);
    }

    #[tokio::test]
    async fn test_on_failure_handler_scheduled() {
        let app_id = Function::derive_app_id("http://localhost:3000/api/strand");
        let mut failing = function("flaky", "job/run");
        failing.on_failure = Some("flaky-failure".to_string());
        let mut handler = function("flaky-failure", "never/fired");
        handler.id = Function::derive_id(app_id, "flaky-failure");
        let h = harness(vec![failing.clone(), handler.clone()]);

        let failed = TrackedEvent::new(event::function_failed(
            failing.id,
            ids::new_id(),
            None,
            json!({"message": "boom"}),
        ));
        let runs = h.runner.ingest(&failed).await.unwrap();
        assert_eq!(runs.len(), 1);
        let meta = h.state.load_run(runs[0]).await.unwrap();
        assert_eq!(meta.identifier.function_id, handler.id);
    }
}
