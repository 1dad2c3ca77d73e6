// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Postgres-backed registry implementation.

use std::collections::HashMap;

use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use strand_core::event::TrackedEvent;
use strand_core::function::Function;
use strand_core::ids;
use strand_core::state::RunIdentifier;
use strand_expr::Compiled;

use super::{resolve_versions, AppRecord, EventRow, FunctionRecord, Registry, RunRecord, SyncOutcome};
use crate::error::{Result, ServerError};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// How many recent events an in-process filter scans at most.
const FILTER_SCAN_LIMIT: i64 = 5_000;

/// Postgres-backed registry.
#[derive(Clone)]
pub struct PostgresRegistry {
    pool: PgPool,
}

impl PostgresRegistry {
    /// Wrap an existing pool. Migrations must already have run.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `uri` and run migrations.
    pub async fn connect(uri: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(uri).await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Registry for PostgresRegistry {
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
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET name = excluded.name, synced_at_ms = excluded.synced_at_ms
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
            WHERE f.app_id = $1
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
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id, version) DO NOTHING
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
        let removed: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT id) FROM functions WHERE app_id = $1 AND id <> ALL($2)",
        )
        .bind(app_id.to_string())
        .bind(&keep)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM functions WHERE app_id = $1 AND id <> ALL($2)")
            .bind(app_id.to_string())
            .bind(&keep)
            .execute(&mut *tx)
            .await?;

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
            INSERT INTO events (internal_id, event_id, name, data, "user", ts, version, received_at_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (internal_id) DO NOTHING
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
        // Postgres lacks SQLite's json_extract, so the filter expression is
        // evaluated in process over a bounded window of recent events.
        let compiled = filter
            .map(Compiled::new)
            .transpose()
            .map_err(|e| ServerError::BadRequest(format!("invalid filter: {e}")))?;

        let scan = if compiled.is_some() { FILTER_SCAN_LIMIT } else { limit };
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT internal_id, event_id, name, data, "user", ts, version, received_at_ms
            FROM events ORDER BY received_at_ms DESC LIMIT $1
            "#,
        )
        .bind(scan)
        .fetch_all(&self.pool)
        .await?;

        let Some(compiled) = compiled else { return Ok(rows) };
        let mut matched = Vec::new();
        for row in rows {
            if matched.len() as i64 >= limit {
                break;
            }
            let scope = event_scope(&row)?;
            if compiled.matches(&scope).unwrap_or(false) {
                matched.push(row);
            }
        }
        Ok(matched)
    }

    async fn record_run_scheduled(&self, id: &RunIdentifier, at_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, function_id, function_version, status, started_at_ms)
            VALUES ($1, $2, $3, 'scheduled', $4)
            ON CONFLICT (run_id) DO NOTHING
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
            SET status = $1,
                ended_at_ms = COALESCE($2, ended_at_ms),
                output = COALESCE($3, output)
            WHERE run_id = $4
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
                    FROM runs WHERE function_id = $1
                    ORDER BY started_at_ms DESC LIMIT $2
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
                    FROM runs ORDER BY started_at_ms DESC LIMIT $1
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

/// Rebuild the `{"event": ...}` expression scope from a stored row.
fn event_scope(row: &EventRow) -> Result<Value> {
    let data: Value = serde_json::from_str(&row.data)?;
    let user: Value = serde_json::from_str(&row.user)?;
    Ok(json!({
        "event": {
            "id": row.event_id,
            "name": row.name,
            "data": data,
            "user": user,
            "ts": row.ts,
            "v": row.version,
        }
    }))
}
