// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed registry implementation.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use strand_core::event::TrackedEvent;
use strand_core::function::Function;
use strand_core::ids;
use strand_core::state::RunIdentifier;
use strand_expr::to_sql_filter;

use super::{resolve_versions, AppRecord, EventRow, FunctionRecord, Registry, RunRecord, SyncOutcome};
use crate::error::{Result, ServerError};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed registry.
#[derive(Clone)]
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    /// Wrap an existing pool. Migrations must already have run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) `strand.db` under `dir` and run migrations.
    pub async fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            ServerError::Config(format!("cannot create sqlite dir {}: {e}", dir.display()))
        })?;
        let url = format!("sqlite:{}?mode=rwc", dir.join("strand.db").to_string_lossy());
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&url).await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Registry for SqliteRegistry {
    async fn sync_app(
        &self,
        url: &str,
        name: &str,
        functions: Vec<Function>,
    ) -> Result<SyncOutcome> {
        let app_id = Function::derive_app_id(url);
        let now = ids::now_ms() as i64;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO apps (id, url, name, created_at_ms, synced_at_ms)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name, synced_at_ms = excluded.synced_at_ms
            "#,
        )
        .bind(app_id.to_string())
        .bind(url)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let rows: Vec<(String, i32, String)> = sqlx::query_as(
            r#"
            SELECT f.id, f.version, f.config_hash
            FROM functions f
            WHERE f.app_id = ?
              AND f.version = (SELECT MAX(version) FROM functions WHERE id = f.id)
            "#,
        )
        .bind(app_id.to_string())
        .fetch_all(&mut *tx)
        .await?;
        let stored: HashMap<String, (i32, String)> =
            rows.into_iter().map(|(id, version, hash)| (id, (version, hash))).collect();

        let (resolved, added, updated) = resolve_versions(functions, &stored);

        for f in &resolved {
            sqlx::query(
                r#"
                INSERT INTO functions (id, app_id, slug, version, config, config_hash, created_at_ms)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id, version) DO NOTHING
                "#,
            )
            .bind(f.id.to_string())
            .bind(app_id.to_string())
            .bind(&f.slug)
            .bind(f.version)
            .bind(serde_json::to_string(f)?)
            .bind(f.config_hash())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        // Functions absent from this sync are dropped with their history.
        let keep: Vec<String> = resolved.iter().map(|f| f.id.to_string()).collect();
        let placeholders = vec!["?"; keep.len()].join(", ");
        let (count_sql, delete_sql) = if keep.is_empty() {
            (
                "SELECT COUNT(DISTINCT id) FROM functions WHERE app_id = ?".to_string(),
                "DELETE FROM functions WHERE app_id = ?".to_string(),
            )
        } else {
            (
                format!(
                    "SELECT COUNT(DISTINCT id) FROM functions WHERE app_id = ? AND id NOT IN ({placeholders})"
                ),
                format!("DELETE FROM functions WHERE app_id = ? AND id NOT IN ({placeholders})"),
            )
        };
        let mut count_q = sqlx::query_scalar::<_, i64>(&count_sql).bind(app_id.to_string());
        for id in &keep {
            count_q = count_q.bind(id);
        }
        let removed = count_q.fetch_one(&mut *tx).await?;
        let mut delete_q = sqlx::query(&delete_sql).bind(app_id.to_string());
        for id in &keep {
            delete_q = delete_q.bind(id);
        }
        delete_q.execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(SyncOutcome { app_id, functions: resolved, added, updated, removed: removed as usize })
    }

    async fn apps(&self) -> Result<Vec<AppRecord>> {
        Ok(sqlx::query_as::<_, AppRecord>(
            "SELECT id, url, name, created_at_ms, synced_at_ms FROM apps ORDER BY url",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn functions(&self) -> Result<Vec<Function>> {
        let records = sqlx::query_as::<_, FunctionRecord>(
            r#"
            SELECT f.id, f.app_id, f.slug, f.version, f.config, f.config_hash, f.created_at_ms
            FROM functions f
            JOIN (SELECT id, MAX(version) AS version FROM functions GROUP BY id) latest
              ON f.id = latest.id AND f.version = latest.version
            ORDER BY f.slug
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        records.iter().map(FunctionRecord::function).collect()
    }

    async fn record_event(&self, event: &TrackedEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (internal_id, event_id, name, data, user, ts, version, received_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(internal_id) DO NOTHING
            "#,
        )
        .bind(event.internal_id.to_string())
        .bind(&event.event.id)
        .bind(&event.event.name)
        .bind(serde_json::to_string(&event.event.data)?)
        .bind(serde_json::to_string(&event.event.user)?)
        .bind(event.event.ts)
        .bind(&event.event.v)
        .bind(event.received_at_ms() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn search_events(&self, filter: Option<&str>, limit: i64) -> Result<Vec<EventRow>> {
        let mut sql = String::from(
            "SELECT internal_id, event_id, name, data, user, ts, version, received_at_ms FROM events",
        );
        let binds = match filter {
            Some(source) => {
                let compiled = to_sql_filter(source)
                    .map_err(|e| ServerError::BadRequest(format!("invalid filter: {e}")))?;
                sql.push_str(" WHERE ");
                sql.push_str(&compiled.clause);
                compiled.binds
            }
            None => Vec::new(),
        };
        sql.push_str(" ORDER BY received_at_ms DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, EventRow>(&sql);
        for value in &binds {
            query = bind_value(query, value);
        }
        Ok(query.bind(limit).fetch_all(&self.pool).await?)
    }

    async fn record_run_scheduled(&self, id: &RunIdentifier, at_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, function_id, function_version, status, started_at_ms)
            VALUES (?, ?, ?, 'scheduled', ?)
            ON CONFLICT(run_id) DO NOTHING
            "#,
        )
        .bind(id.run_id.to_string())
        .bind(id.function_id.to_string())
        .bind(id.function_version)
        .bind(at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_run_status(
        &self,
        run_id: Uuid,
        status: &str,
        ended_at_ms: Option<i64>,
        output: Option<&Value>,
    ) -> Result<()> {
        let output = output.map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            UPDATE runs
            SET status = ?,
                ended_at_ms = COALESCE(?, ended_at_ms),
                output = COALESCE(?, output)
            WHERE run_id = ?
            "#,
        )
        .bind(status)
        .bind(ended_at_ms)
        .bind(output)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn runs(&self, function_id: Option<Uuid>, limit: i64) -> Result<Vec<RunRecord>> {
        let rows = match function_id {
            Some(id) => {
                sqlx::query_as::<_, RunRecord>(
                    r#"
                    SELECT run_id, function_id, function_version, status, started_at_ms, ended_at_ms, output
                    FROM runs WHERE function_id = ?
                    ORDER BY started_at_ms DESC LIMIT ?
                    "#,
                )
                .bind(id.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, RunRecord>(
                    r#"
                    SELECT run_id, function_id, function_version, status, started_at_ms, ended_at_ms, output
                    FROM runs ORDER BY started_at_ms DESC LIMIT ?
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }
}

type SqliteQueryAs<'q, T> =
    sqlx::query::QueryAs<'q, sqlx::Sqlite, T, sqlx::sqlite::SqliteArguments<'q>>;

/// Bind a JSON literal from a filter as its natural SQL type so comparisons
/// against `json_extract` results keep SQLite's type semantics.
fn bind_value<'q, T>(query: SqliteQueryAs<'q, T>, value: &Value) -> SqliteQueryAs<'q, T> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap_or_default()),
        Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::event::Event;
    use strand_core::function::Trigger;

    async fn registry() -> (SqliteRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = SqliteRegistry::from_dir(dir.path()).await.unwrap();
        (registry, dir)
    }

    fn sample(url: &str, slug: &str) -> Function {
        let app_id = Function::derive_app_id(url);
        Function {
            id: Function::derive_id(app_id, slug),
            app_id,
            slug: slug.to_string(),
            name: String::new(),
            version: 0,
            url: url.to_string(),
            triggers: vec![Trigger::Event { event: "test/run".to_string(), expression: None }],
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

    #[tokio::test]
    async fn test_sync_app_assigns_and_bumps_versions() {
        let (registry, _dir) = registry().await;
        let url = "http://localhost:3000/api/strand";

        let outcome =
            registry.sync_app(url, "shop", vec![sample(url, "a"), sample(url, "b")]).await.unwrap();
        assert_eq!(outcome.added, 2);
        assert!(outcome.functions.iter().all(|f| f.version == 1));

        // An unchanged re-sync keeps versions; a changed config bumps one.
        let mut changed = sample(url, "a");
        changed.max_attempts = Some(9);
        let outcome = registry.sync_app(url, "shop", vec![changed, sample(url, "b")]).await.unwrap();
        assert_eq!(outcome.added, 0);
        assert_eq!(outcome.updated, 1);
        let versions: HashMap<_, _> =
            outcome.functions.iter().map(|f| (f.slug.clone(), f.version)).collect();
        assert_eq!(versions["a"], 2);
        assert_eq!(versions["b"], 1);
    }

    #[tokio::test]
    async fn test_sync_app_removes_missing_functions() {
        let (registry, _dir) = registry().await;
        let url = "http://localhost:3000/api/strand";

        registry.sync_app(url, "shop", vec![sample(url, "a"), sample(url, "b")]).await.unwrap();
        let outcome = registry.sync_app(url, "shop", vec![sample(url, "a")]).await.unwrap();
        assert_eq!(outcome.removed, 1);

        let functions = registry.functions().await.unwrap();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].slug, "a");
    }

    #[tokio::test]
    async fn test_functions_returns_latest_versions() {
        let (registry, _dir) = registry().await;
        let url = "http://localhost:3000/api/strand";

        registry.sync_app(url, "shop", vec![sample(url, "a")]).await.unwrap();
        let mut changed = sample(url, "a");
        changed.timeout_secs = Some(30);
        registry.sync_app(url, "shop", vec![changed]).await.unwrap();

        let functions = registry.functions().await.unwrap();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].version, 2);
        assert_eq!(functions[0].timeout_secs, Some(30));
    }

    #[tokio::test]
    async fn test_event_search_with_filter() {
        let (registry, _dir) = registry().await;
        registry.record_event(&tracked("order/created", json!({"total": 50}))).await.unwrap();
        registry.record_event(&tracked("order/created", json!({"total": 250}))).await.unwrap();
        registry.record_event(&tracked("user/signup", json!({}))).await.unwrap();

        let all = registry.search_events(None, 10).await.unwrap();
        assert_eq!(all.len(), 3);

        let filtered = registry
            .search_events(Some("event.name == 'order/created' && event.data.total > 100"), 10)
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        let data: Value = serde_json::from_str(&filtered[0].data).unwrap();
        assert_eq!(data["total"], 250);

        let err = registry.search_events(Some("not an expression !!"), 10).await;
        assert!(matches!(err, Err(ServerError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_run_history_lifecycle() {
        let (registry, _dir) = registry().await;
        let id = RunIdentifier {
            run_id: Uuid::now_v7(),
            function_id: Uuid::new_v4(),
            function_version: 1,
        };

        registry.record_run_scheduled(&id, 1_000).await.unwrap();
        registry.record_run_status(id.run_id, "running", None, None).await.unwrap();
        registry
            .record_run_status(id.run_id, "completed", Some(2_000), Some(&json!({"ok": true})))
            .await
            .unwrap();

        let runs = registry.runs(Some(id.function_id), 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "completed");
        assert_eq!(runs[0].ended_at_ms, Some(2_000));
        let output: Value = serde_json::from_str(runs[0].output.as_deref().unwrap()).unwrap();
        assert_eq!(output["ok"], true);

        assert!(registry.runs(Some(Uuid::new_v4()), 10).await.unwrap().is_empty());
    }
}
