// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API: event ingestion and SDK app registration.
//!
//! Two write surfaces, mirroring the SDK protocol:
//! - `POST /e/{key}` ingests a single event or an array of events.
//! - `POST /fn/register` syncs an app's function configs.
//!
//! Read surfaces expose the registry's event and run history.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use strand_core::event::{Event, TrackedEvent, MAX_EVENT_BODY_BYTES};
use strand_core::function::{
    Batch, CancelOn, Concurrency, Debounce, Function, Priority, RateLimit, Throttle, Trigger,
};
use strand_core::runner::Runner;

use crate::error::{Result, ServerError};
use crate::registry::{Registry, SharedFunctions};

/// Header seeding deterministic internal event IDs: `<millis>,<base64-entropy>`.
pub const IDEMPOTENCY_HEADER: &str = "x-strand-event-idempotency";

/// Shared state behind the router.
#[derive(Clone)]
pub struct ApiState {
    /// Event runner for ingestion.
    pub runner: Arc<Runner>,
    /// Durable registry.
    pub registry: Arc<dyn Registry>,
    /// In-memory function cache the engine loads from.
    pub functions: SharedFunctions,
    /// Accepted event keys. Empty accepts any key.
    pub event_keys: Vec<String>,
    /// Default retry interval applied to functions that set none.
    pub retry_interval: Option<u64>,
}

impl ApiState {
    /// Reload the function cache from the registry. Returns the number of
    /// cached functions.
    pub async fn refresh_functions(&self) -> Result<usize> {
        let mut functions = self.registry.functions().await?;
        if let Some(interval) = self.retry_interval {
            for f in &mut functions {
                f.retry_interval_secs.get_or_insert(interval);
            }
        }
        let count = functions.len();
        self.functions.replace(functions);
        Ok(count)
    }
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/e/{key}", post(ingest_events))
        .route("/fn/register", post(register_app))
        .route("/v1/events", get(list_events))
        .route("/v1/runs", get(list_runs))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_EVENT_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn not_found() -> impl IntoResponse {
    ServerError::BadRequest("no such route".to_string()).into_response()
}

async fn ingest_events(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    if !state.event_keys.is_empty() && !state.event_keys.iter().any(|k| *k == key) {
        return Err(ServerError::Unauthorized);
    }

    let events: Vec<Event> = if body.is_array() {
        serde_json::from_value(body)?
    } else {
        vec![serde_json::from_value(body)?]
    };
    if events.is_empty() {
        return Err(ServerError::BadRequest("no events in body".to_string()));
    }
    for event in &events {
        event.validate().map_err(ServerError::Engine)?;
    }

    let seed = idempotency_seed(&headers)?;
    let mut ids = Vec::with_capacity(events.len());
    for (index, event) in events.into_iter().enumerate() {
        let tracked = match &seed {
            Some((millis, entropy)) => {
                // Each array position gets distinct entropy so a retried
                // batch reproduces the same per-event IDs.
                let mut entropy = entropy.clone();
                entropy.push(index as u8);
                TrackedEvent::seeded(event, *millis, &entropy)
            }
            None => TrackedEvent::new(event),
        };
        state.registry.record_event(&tracked).await?;
        state.runner.ingest(&tracked).await?;
        ids.push(tracked.internal_id.to_string());
    }

    Ok(Json(json!({ "ids": ids })))
}

/// Parse the idempotency header into `(millis, entropy)`.
fn idempotency_seed(headers: &HeaderMap) -> Result<Option<(u64, Vec<u8>)>> {
    let Some(raw) = headers.get(IDEMPOTENCY_HEADER) else { return Ok(None) };
    let raw = raw
        .to_str()
        .map_err(|_| ServerError::BadRequest("idempotency header is not ASCII".to_string()))?;
    let (millis, entropy) = raw
        .split_once(',')
        .ok_or_else(|| ServerError::BadRequest("idempotency header wants <ms>,<b64>".to_string()))?;
    let millis: u64 = millis
        .parse()
        .map_err(|_| ServerError::BadRequest("idempotency millis must be an integer".to_string()))?;
    let entropy = base64::engine::general_purpose::STANDARD
        .decode(entropy.trim())
        .map_err(|_| ServerError::BadRequest("idempotency entropy is not base64".to_string()))?;
    Ok(Some((millis, entropy)))
}

/// App registration payload sent by SDKs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// SDK endpoint URL; also the app's identity.
    pub url: String,
    /// Display name.
    #[serde(default)]
    pub app_name: String,
    /// Function configs served at the URL.
    pub functions: Vec<RegisterFunction>,
}

/// One function config in a registration payload. Identity and version are
/// server-derived, so the SDK only sends the slug and behavior.
#[derive(Debug, Deserialize)]
pub struct RegisterFunction {
    /// Stable slug, unique within the app.
    pub slug: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Triggers; at least one.
    pub triggers: Vec<Trigger>,
    /// Concurrency limits.
    #[serde(default)]
    pub concurrency: Vec<Concurrency>,
    /// Run-creation rate limit.
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    /// Lease-time throttle.
    #[serde(default)]
    pub throttle: Option<Throttle>,
    /// Priority factor expression.
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Debounce configuration.
    #[serde(default)]
    pub debounce: Option<Debounce>,
    /// Batch configuration.
    #[serde(default)]
    pub batch: Option<Batch>,
    /// Cancellation triggers.
    #[serde(default)]
    pub cancel_on: Vec<CancelOn>,
    /// Idempotency key expression.
    #[serde(default)]
    pub idempotency: Option<String>,
    /// Maximum attempts per step.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Fixed retry interval in seconds.
    #[serde(default)]
    pub retry_interval_secs: Option<u64>,
    /// Per-dispatch timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Slug of a step to run after retries are exhausted.
    #[serde(default)]
    pub on_failure: Option<String>,
}

impl RegisterFunction {
    fn into_function(self, app_id: Uuid, url: &str) -> Result<Function> {
        if self.slug.is_empty() {
            return Err(ServerError::BadRequest("function slug is required".to_string()));
        }
        if self.triggers.is_empty() {
            return Err(ServerError::BadRequest(format!(
                "function {} needs at least one trigger",
                self.slug
            )));
        }
        Ok(Function {
            id: Function::derive_id(app_id, &self.slug),
            app_id,
            slug: self.slug,
            name: self.name,
            version: 0,
            url: url.to_string(),
            triggers: self.triggers,
            concurrency: self.concurrency,
            rate_limit: self.rate_limit,
            throttle: self.throttle,
            priority: self.priority,
            debounce: self.debounce,
            batch: self.batch,
            cancel_on: self.cancel_on,
            idempotency: self.idempotency,
            max_attempts: self.max_attempts,
            retry_interval_secs: self.retry_interval_secs,
            timeout_secs: self.timeout_secs,
            on_failure: self.on_failure,
        })
    }
}

async fn register_app(
    State(state): State<ApiState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<Value>> {
    if request.url.is_empty() {
        return Err(ServerError::BadRequest("url is required".to_string()));
    }
    let app_id = Function::derive_app_id(&request.url);
    let functions: Vec<Function> = request
        .functions
        .into_iter()
        .map(|f| f.into_function(app_id, &request.url))
        .collect::<Result<_>>()?;

    let outcome = state.registry.sync_app(&request.url, &request.app_name, functions).await?;
    state.refresh_functions().await?;

    tracing::info!(
        app = %request.url,
        added = outcome.added,
        updated = outcome.updated,
        removed = outcome.removed,
        "app synced"
    );
    Ok(Json(json!({
        "app_id": outcome.app_id.to_string(),
        "added": outcome.added,
        "updated": outcome.updated,
        "removed": outcome.removed,
        "functions": outcome
            .functions
            .iter()
            .map(|f| json!({ "id": f.id.to_string(), "slug": f.slug, "version": f.version }))
            .collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    /// Optional match expression over `event.*`.
    filter: Option<String>,
    limit: Option<i64>,
}

async fn list_events(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 1000);
    let rows = state.registry.search_events(query.filter.as_deref(), limit).await?;
    let events = rows
        .iter()
        .map(|row| {
            Ok(json!({
                "internal_id": row.internal_id,
                "id": row.event_id,
                "name": row.name,
                "data": serde_json::from_str::<Value>(&row.data)?,
                "user": serde_json::from_str::<Value>(&row.user)?,
                "ts": row.ts,
                "received_at_ms": row.received_at_ms,
            }))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Json(json!({ "events": events })))
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    function_id: Option<Uuid>,
    limit: Option<i64>,
}

async fn list_runs(
    State(state): State<ApiState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 1000);
    let rows = state.registry.runs(query.function_id, limit).await?;
    let runs = rows
        .iter()
        .map(|row| {
            json!({
                "run_id": row.run_id,
                "function_id": row.function_id,
                "function_version": row.function_version,
                "status": row.status,
                "started_at_ms": row.started_at_ms,
                "ended_at_ms": row.ended_at_ms,
                "output": row
                    .output
                    .as_deref()
                    .and_then(|raw| serde_json::from_str::<Value>(raw).ok()),
            })
        })
        .collect::<Vec<_>>();
    Ok(Json(json!({ "runs": runs })))
}
