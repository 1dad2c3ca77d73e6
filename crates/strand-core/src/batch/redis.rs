// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-backed batch store.

use redis::AsyncCommands;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::event::TrackedEvent;
use crate::ids;
use crate::kv::{self, KeyGen, RedisHandle};

use super::{Appended, BatchStore};

/// Batch store over Redis.
pub struct RedisBatchStore {
    kv: RedisHandle,
    keys: KeyGen,
}

impl RedisBatchStore {
    /// Create a store over an existing connection.
    pub fn new(kv: RedisHandle, keys: KeyGen) -> Self {
        Self { kv, keys }
    }

    fn items_prefix(&self) -> String {
        // KeyGen with an empty ID yields the shared prefix.
        self.keys.batch_items("")
    }

    fn status_prefix(&self) -> String {
        self.keys.batch_status("")
    }
}

/// Parse one "batch_id:created:count:full" script reply.
fn parse_appended(script: &'static str, reply: &str) -> Result<Appended> {
    let mut parts = reply.rsplitn(4, ':');
    let full = parts.next();
    let count = parts.next();
    let created = parts.next();
    let batch_id = parts.next();
    match (batch_id, created, count, full) {
        (Some(id), Some(created), Some(count), Some(full)) => Ok(Appended {
            batch_id: Uuid::parse_str(id).map_err(|_| EngineError::ScriptError {
                script: script.to_string(),
                message: format!("bad batch id '{id}'"),
            })?,
            created: created == "1",
            count: count.parse().unwrap_or(0),
            full: full == "1",
        }),
        _ => Err(EngineError::ScriptError {
            script: script.to_string(),
            message: reply.to_string(),
        }),
    }
}

#[async_trait::async_trait]
impl BatchStore for RedisBatchStore {
    async fn append(
        &self,
        function_id: Uuid,
        key: &str,
        event: &TrackedEvent,
        max_size: usize,
    ) -> Result<Appended> {
        let candidate = ids::new_id();
        let blob = serde_json::to_string(event)?;
        let mut conn = self.kv.conn();
        let reply: String = kv::BATCH_APPEND
            .key(self.keys.batch_pointer(&function_id.to_string(), key))
            .arg(&blob)
            .arg(candidate.to_string())
            .arg(max_size)
            .arg(self.items_prefix())
            .arg(self.status_prefix())
            .invoke_async(&mut conn)
            .await?;

        parse_appended("batch_append", &reply)
    }

    async fn append_bulk(
        &self,
        function_id: Uuid,
        key: &str,
        events: &[TrackedEvent],
        max_size: usize,
    ) -> Result<Vec<Appended>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let mut invocation = kv::BATCH_APPEND_BULK
            .key(self.keys.batch_pointer(&function_id.to_string(), key));
        invocation
            .arg(max_size)
            .arg(self.items_prefix())
            .arg(self.status_prefix())
            .arg(events.len());
        for event in events {
            invocation.arg(serde_json::to_string(event)?);
        }
        for _ in events {
            invocation.arg(ids::new_id().to_string());
        }
        let mut conn = self.kv.conn();
        let reply: String = invocation.invoke_async(&mut conn).await?;

        let mut out = Vec::with_capacity(events.len());
        for part in reply.split(';') {
            out.push(parse_appended("batch_append_bulk", part)?);
        }
        if out.len() != events.len() {
            return Err(EngineError::ScriptError {
                script: "batch_append_bulk".to_string(),
                message: format!("{} replies for {} events", out.len(), events.len()),
            });
        }
        Ok(out)
    }

    async fn claim(&self, function_id: Uuid, key: &str, batch_id: Uuid) -> Result<()> {
        let bid = batch_id.to_string();
        let mut conn = self.kv.conn();
        let reply: String = kv::BATCH_CLAIM
            .key(self.keys.batch_status(&bid))
            .key(self.keys.batch_items(&bid))
            .key(self.keys.batch_pointer(&function_id.to_string(), key))
            .arg(&bid)
            .invoke_async(&mut conn)
            .await?;
        match reply.as_str() {
            "ok" => Ok(()),
            "missing" | "claimed" => Err(EngineError::BatchNotFound(bid)),
            other => Err(EngineError::ScriptError {
                script: "batch_claim".to_string(),
                message: other.to_string(),
            }),
        }
    }

    async fn events(&self, batch_id: Uuid) -> Result<Vec<TrackedEvent>> {
        let mut conn = self.kv.conn();
        let blobs: Vec<String> =
            conn.lrange(self.keys.batch_items(&batch_id.to_string()), 0, -1).await?;
        let mut out = Vec::with_capacity(blobs.len());
        for blob in blobs {
            out.push(serde_json::from_str(&blob)?);
        }
        Ok(out)
    }

    async fn delete(&self, batch_id: Uuid) -> Result<()> {
        let bid = batch_id.to_string();
        let mut conn = self.kv.conn();
        let _: () =
            conn.del(&[self.keys.batch_items(&bid), self.keys.batch_status(&bid)]).await?;
        Ok(())
    }
}
