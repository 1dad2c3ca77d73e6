// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-backed run state store.

use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::event::TrackedEvent;
use crate::kv::{self, KeyGen, RedisHandle};

use super::{RUN_RETENTION, RunMetadata, RunStatus, StateLimits, StateStore};

/// TTL on run-creation idempotency markers: 24 hours.
const IDEMPOTENCY_TTL_SECS: u64 = 24 * 60 * 60;

/// Run state over Redis.
pub struct RedisStateStore {
    kv: RedisHandle,
    keys: KeyGen,
    limits: StateLimits,
}

impl RedisStateStore {
    /// Create a store over an existing connection.
    pub fn new(kv: RedisHandle, keys: KeyGen, limits: StateLimits) -> Self {
        Self { kv, keys, limits }
    }

    async fn write_metadata(&self, meta: &RunMetadata) -> Result<()> {
        let mut conn = self.kv.conn();
        let blob = serde_json::to_string(meta)?;
        let _: () = conn
            .hset(self.keys.run_metadata(&meta.identifier.run_id.to_string()), "meta", blob)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StateStore for RedisStateStore {
    async fn create_run(
        &self,
        metadata: &RunMetadata,
        events: &[TrackedEvent],
        idempotency_key: Option<&str>,
    ) -> Result<()> {
        let run_id = metadata.identifier.run_id.to_string();
        let mut conn = self.kv.conn();

        if let Some(key) = idempotency_key {
            let marker = self.keys.run_idempotency(key);
            let set: bool = redis::cmd("SET")
                .arg(&marker)
                .arg(&run_id)
                .arg("NX")
                .arg("EX")
                .arg(IDEMPOTENCY_TTL_SECS)
                .query_async(&mut conn)
                .await?;
            if !set {
                return Err(EngineError::RunExists(run_id));
            }
        }

        let exists: bool = conn.hexists(self.keys.run_metadata(&run_id), "meta").await?;
        if exists {
            return Err(EngineError::RunExists(run_id));
        }

        self.write_metadata(metadata).await?;
        let events_blob = serde_json::to_string(events)?;
        let _: () = conn.set(self.keys.run_events(&run_id), events_blob).await?;
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<RunMetadata> {
        let mut conn = self.kv.conn();
        let blob: Option<String> =
            conn.hget(self.keys.run_metadata(&run_id.to_string()), "meta").await?;
        let blob = blob.ok_or_else(|| EngineError::Validation {
            field: "run_id".to_string(),
            message: format!("run '{run_id}' not found"),
        })?;
        Ok(serde_json::from_str(&blob)?)
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<TrackedEvent>> {
        let mut conn = self.kv.conn();
        let blob: Option<String> = conn.get(self.keys.run_events(&run_id.to_string())).await?;
        match blob {
            Some(blob) => Ok(serde_json::from_str(&blob)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save_step(&self, run_id: Uuid, step_id: &str, output: &Value) -> Result<()> {
        let rid = run_id.to_string();
        let blob = serde_json::to_string(output)?;
        let mut conn = self.kv.conn();
        let reply: String = kv::SAVE_STEP
            .key(self.keys.run_steps(&rid))
            .key(self.keys.run_stack(&rid))
            .key(self.keys.run_metadata(&rid))
            .arg(step_id)
            .arg(&blob)
            .arg(self.limits.max_steps)
            .arg(self.limits.max_bytes)
            .arg(blob.len())
            .invoke_async(&mut conn)
            .await?;
        match reply.as_str() {
            "ok" => Ok(()),
            "dup" => Err(EngineError::StepAlreadyExists {
                run_id: rid,
                step_id: step_id.to_string(),
            }),
            "limit" => {
                Err(EngineError::StepLimitExceeded { run_id: rid, limit: self.limits.max_steps })
            }
            "size" => Err(EngineError::StateSizeLimitExceeded {
                run_id: rid,
                limit: self.limits.max_bytes,
            }),
            other => Err(EngineError::ScriptError {
                script: "save_step".to_string(),
                message: other.to_string(),
            }),
        }
    }

    async fn steps(&self, run_id: Uuid) -> Result<HashMap<String, Value>> {
        let mut conn = self.kv.conn();
        let raw: HashMap<String, String> =
            conn.hgetall(self.keys.run_steps(&run_id.to_string())).await?;
        let mut out = HashMap::with_capacity(raw.len());
        for (step_id, blob) in raw {
            out.insert(step_id, serde_json::from_str(&blob)?);
        }
        Ok(out)
    }

    async fn stack(&self, run_id: Uuid) -> Result<Vec<String>> {
        let mut conn = self.kv.conn();
        let stack: Vec<String> =
            conn.lrange(self.keys.run_stack(&run_id.to_string()), 0, -1).await?;
        Ok(stack)
    }

    async fn set_status(&self, run_id: Uuid, status: RunStatus, now_ms: u64) -> Result<()> {
        let mut meta = self.load_run(run_id).await?;
        if meta.status.is_terminal() {
            // Terminal transitions are final.
            return Ok(());
        }
        meta.status = status;
        if status == RunStatus::Running && meta.started_at_ms.is_none() {
            meta.started_at_ms = Some(now_ms);
        }
        if status.is_terminal() {
            meta.ended_at_ms = Some(now_ms);
        }
        self.write_metadata(&meta).await
    }

    async fn finalize(&self, run_id: Uuid, status: RunStatus, now_ms: u64) -> Result<()> {
        let mut meta = self.load_run(run_id).await?;
        if meta.status.is_terminal() {
            // Terminal transitions are final.
            return Ok(());
        }
        meta.status = status;
        meta.ended_at_ms = Some(now_ms);
        self.write_metadata(&meta).await?;

        // The TTL is the deletion schedule; nothing sweeps these keys sooner.
        let rid = run_id.to_string();
        let retention_ms = RUN_RETENTION.as_millis() as i64;
        let mut conn = self.kv.conn();
        for key in [
            self.keys.run_metadata(&rid),
            self.keys.run_steps(&rid),
            self.keys.run_stack(&rid),
            self.keys.run_events(&rid),
        ] {
            let _: () = conn.pexpire(key, retention_ms).await?;
        }
        Ok(())
    }

    async fn set_request_version(&self, run_id: Uuid, version: i32) -> Result<()> {
        let mut meta = self.load_run(run_id).await?;
        if meta.request_version == version {
            return Ok(());
        }
        meta.request_version = version;
        self.write_metadata(&meta).await
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<()> {
        let rid = run_id.to_string();
        let mut conn = self.kv.conn();
        let _: () = conn
            .del(&[
                self.keys.run_metadata(&rid),
                self.keys.run_steps(&rid),
                self.keys.run_stack(&rid),
                self.keys.run_events(&rid),
            ])
            .await?;
        Ok(())
    }
}
