// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function registry and history persistence.
//!
//! The registry is the server's durable record of registered apps, function
//! config versions, ingested events and run history. It is deliberately
//! separate from the engine's hot-path state: the engine reads function
//! configs through an in-memory [`SharedFunctions`] cache that the server
//! refreshes after each sync.

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresRegistry;
pub use sqlite::SqliteRegistry;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use uuid::Uuid;

use strand_core::event::TrackedEvent;
use strand_core::function::{Function, FunctionLoader};
use strand_core::state::RunIdentifier;

use crate::error::Result;

/// A registered app.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppRecord {
    /// Deterministic app ID (UUIDv5 of the URL), stored as text.
    pub id: String,
    /// SDK endpoint URL.
    pub url: String,
    /// Display name reported by the SDK.
    pub name: String,
    /// When the app first registered.
    pub created_at_ms: i64,
    /// When the app last synced.
    pub synced_at_ms: i64,
}

/// One stored function config version.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FunctionRecord {
    /// Deterministic function ID, stored as text.
    pub id: String,
    /// Owning app ID.
    pub app_id: String,
    /// Stable slug within the app.
    pub slug: String,
    /// Config version.
    pub version: i32,
    /// Full function config as JSON.
    pub config: String,
    /// Hash of the version-relevant config.
    pub config_hash: String,
    /// When this version was stored.
    pub created_at_ms: i64,
}

impl FunctionRecord {
    /// Parse the stored config back into a [`Function`].
    pub fn function(&self) -> Result<Function> {
        Ok(serde_json::from_str(&self.config)?)
    }
}

/// One ingested event, as stored for history and search.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    /// Time-ordered internal ID.
    pub internal_id: String,
    /// Caller-supplied event ID, possibly empty.
    pub event_id: String,
    /// Event name.
    pub name: String,
    /// JSON payload.
    pub data: String,
    /// JSON user payload.
    pub user: String,
    /// Event timestamp in unix milliseconds.
    pub ts: i64,
    /// Payload format version, possibly empty.
    pub version: String,
    /// When the server ingested the event.
    pub received_at_ms: i64,
}

/// One run's history row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    /// Run ID.
    pub run_id: String,
    /// Function the run belongs to.
    pub function_id: String,
    /// Function version frozen at schedule time.
    pub function_version: i32,
    /// Last observed status.
    pub status: String,
    /// When the run was scheduled.
    pub started_at_ms: i64,
    /// When the run reached a terminal status.
    pub ended_at_ms: Option<i64>,
    /// Terminal output or error as JSON.
    pub output: Option<String>,
}

/// Result of syncing an app's functions.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// The app's deterministic ID.
    pub app_id: Uuid,
    /// The app's current function set with resolved versions.
    pub functions: Vec<Function>,
    /// Functions registered for the first time.
    pub added: usize,
    /// Functions whose config changed and version was bumped.
    pub updated: usize,
    /// Functions removed because the sync no longer includes them.
    pub removed: usize,
}

/// Durable registry operations, implemented per SQL backend.
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    /// Register or re-sync an app and its functions in one transaction.
    ///
    /// Incoming functions arrive with version 0. An unchanged config hash
    /// keeps the stored version; a changed hash appends a new version row
    /// with the version bumped. Functions absent from the sync are removed.
    async fn sync_app(&self, url: &str, name: &str, functions: Vec<Function>)
        -> Result<SyncOutcome>;

    /// All registered apps.
    async fn apps(&self) -> Result<Vec<AppRecord>>;

    /// The latest version of every registered function, parsed.
    async fn functions(&self) -> Result<Vec<Function>>;

    /// Append an ingested event to history.
    async fn record_event(&self, event: &TrackedEvent) -> Result<()>;

    /// Recent events, newest first, optionally narrowed by a match
    /// expression over `event.*`.
    async fn search_events(&self, filter: Option<&str>, limit: i64) -> Result<Vec<EventRow>>;

    /// Record that a run was scheduled.
    async fn record_run_scheduled(&self, id: &RunIdentifier, at_ms: i64) -> Result<()>;

    /// Update a run's status, optionally marking it ended with output.
    async fn record_run_status(
        &self,
        run_id: Uuid,
        status: &str,
        ended_at_ms: Option<i64>,
        output: Option<&Value>,
    ) -> Result<()>;

    /// Recent runs, newest first, optionally narrowed to one function.
    async fn runs(&self, function_id: Option<Uuid>, limit: i64) -> Result<Vec<RunRecord>>;
}

/// Resolve versions for an incoming function set against the stored hashes.
///
/// Returns the functions with final versions plus `(added, updated)` counts.
/// Shared by both SQL backends so the bump rule lives in one place.
pub(crate) fn resolve_versions(
    mut incoming: Vec<Function>,
    stored: &HashMap<String, (i32, String)>,
) -> (Vec<Function>, usize, usize) {
    let mut added = 0;
    let mut updated = 0;
    for f in &mut incoming {
        let hash = f.config_hash();
        match stored.get(&f.id.to_string()) {
            None => {
                f.version = 1;
                added += 1;
            }
            Some((version, stored_hash)) if *stored_hash == hash => {
                f.version = *version;
            }
            Some((version, _)) => {
                f.version = version + 1;
                updated += 1;
            }
        }
    }
    (incoming, added, updated)
}

/// In-memory function cache implementing [`FunctionLoader`].
///
/// The engine's loader trait is synchronous and sits on the queue's lease
/// path, so the server keeps the current function set here and refreshes it
/// from the registry after every sync.
#[derive(Debug, Default, Clone)]
pub struct SharedFunctions {
    inner: Arc<RwLock<HashMap<Uuid, Function>>>,
}

impl SharedFunctions {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached set with the given functions.
    pub fn replace(&self, functions: Vec<Function>) {
        let map = functions.into_iter().map(|f| (f.id, f)).collect();
        *self.inner.write().unwrap() = map;
    }

    /// Number of cached functions.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FunctionLoader for SharedFunctions {
    fn function(&self, id: Uuid) -> Option<Function> {
        self.inner.read().unwrap().get(&id).cloned()
    }

    fn functions_by_event(&self, event_name: &str) -> Vec<Function> {
        let map = self.inner.read().unwrap();
        let mut matched: Vec<Function> = map
            .values()
            .filter(|f| f.event_triggers().any(|(name, _)| name == event_name))
            .cloned()
            .collect();
        // Stable order keeps pause matching and tests deterministic.
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    fn functions_with_cron(&self) -> Vec<Function> {
        let map = self.inner.read().unwrap();
        let mut matched: Vec<Function> =
            map.values().filter(|f| f.cron_triggers().next().is_some()).cloned().collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::function::Trigger;

    fn sample(slug: &str, event: &str) -> Function {
        let app_id = Function::derive_app_id("http://localhost:3000/api/strand");
        Function {
            id: Function::derive_id(app_id, slug),
            app_id,
            slug: slug.to_string(),
            name: String::new(),
            version: 0,
            url: "http://localhost:3000/api/strand".to_string(),
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

    #[test]
    fn test_resolve_versions_new_changed_unchanged() {
        let unchanged = sample("same", "a/b");
        let mut changed = sample("changed", "a/b");
        let fresh = sample("fresh", "a/b");

        let mut stored = HashMap::new();
        stored.insert(unchanged.id.to_string(), (3, unchanged.config_hash()));
        stored.insert(changed.id.to_string(), (2, "old-hash".to_string()));
        changed.max_attempts = Some(7);

        let (resolved, added, updated) =
            resolve_versions(vec![unchanged.clone(), changed.clone(), fresh.clone()], &stored);
        assert_eq!(added, 1);
        assert_eq!(updated, 1);

        let by_slug: HashMap<_, _> =
            resolved.into_iter().map(|f| (f.slug.clone(), f.version)).collect();
        assert_eq!(by_slug["same"], 3);
        assert_eq!(by_slug["changed"], 3);
        assert_eq!(by_slug["fresh"], 1);
    }

    #[test]
    fn test_shared_functions_lookup() {
        let cache = SharedFunctions::new();
        assert!(cache.is_empty());

        let f1 = sample("one", "order/created");
        let f2 = sample("two", "order/created");
        cache.replace(vec![f1.clone(), f2.clone()]);

        assert_eq!(cache.function(f1.id).unwrap().slug, "one");
        assert!(cache.function(Uuid::new_v4()).is_none());

        let matched = cache.functions_by_event("order/created");
        assert_eq!(matched.len(), 2);
        assert!(cache.functions_by_event("other/event").is_empty());
        assert!(cache.functions_with_cron().is_empty());
    }

    #[test]
    fn test_shared_functions_replace_drops_old() {
        let cache = SharedFunctions::new();
        let f1 = sample("one", "a/b");
        cache.replace(vec![f1.clone()]);
        cache.replace(vec![sample("two", "a/b")]);
        assert!(cache.function(f1.id).is_none());
        assert_eq!(cache.len(), 1);
    }
}
