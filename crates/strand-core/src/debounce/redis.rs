// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-backed debounce store.

use redis::AsyncCommands;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::event::TrackedEvent;
use crate::ids;
use crate::kv::{self, KeyGen, RedisHandle};

use super::{DebounceStore, Upserted};

/// Debounce store over Redis.
pub struct RedisDebounceStore {
    kv: RedisHandle,
    keys: KeyGen,
}

impl RedisDebounceStore {
    /// Create a store over an existing connection.
    pub fn new(kv: RedisHandle, keys: KeyGen) -> Self {
        Self { kv, keys }
    }
}

#[async_trait::async_trait]
impl DebounceStore for RedisDebounceStore {
    async fn upsert(
        &self,
        function_id: Uuid,
        key: &str,
        event: &TrackedEvent,
        now_ms: u64,
    ) -> Result<Upserted> {
        let candidate = ids::new_id();
        let blob = serde_json::to_string(event)?;
        let mut conn = self.kv.conn();
        let reply: String = kv::DEBOUNCE_UPSERT
            .key(self.keys.debounce_pointer(&function_id.to_string(), key))
            .arg(candidate.to_string())
            .arg(&blob)
            .arg(now_ms)
            .arg(self.keys.debounce(""))
            .invoke_async(&mut conn)
            .await?;

        let (verb, id) = reply.split_once(':').ok_or_else(|| EngineError::ScriptError {
            script: "debounce_upsert".to_string(),
            message: reply.clone(),
        })?;
        let id = Uuid::parse_str(id).map_err(|_| EngineError::ScriptError {
            script: "debounce_upsert".to_string(),
            message: format!("bad debounce id '{id}'"),
        })?;
        match verb {
            "created" => Ok(Upserted::Created { id }),
            "updated" => {
                let created_at: Option<u64> =
                    conn.hget(self.keys.debounce(&id.to_string()), "created_at").await?;
                Ok(Upserted::Updated { id, created_at_ms: created_at.unwrap_or(now_ms) })
            }
            "progress" => Err(EngineError::DebounceInProgress(id.to_string())),
            "migrating" => Err(EngineError::DebounceMigrating(id.to_string())),
            other => Err(EngineError::ScriptError {
                script: "debounce_upsert".to_string(),
                message: other.to_string(),
            }),
        }
    }

    async fn start(&self, id: Uuid) -> Result<TrackedEvent> {
        let key = self.keys.debounce(&id.to_string());
        let mut conn = self.kv.conn();
        // Only the queue-lease holder calls start, so this read-then-set does
        // not race with another starter.
        let started: Option<String> = conn.hget(&key, "started").await?;
        if started.as_deref() == Some("1") {
            return Err(EngineError::DebounceNotFound(id.to_string()));
        }
        let payload: Option<String> = conn.hget(&key, "payload").await?;
        let payload = payload.ok_or_else(|| EngineError::DebounceNotFound(id.to_string()))?;
        let _: () = conn.hset(&key, "started", "1").await?;
        Ok(serde_json::from_str(&payload)?)
    }

    async fn delete(&self, function_id: Uuid, key: &str, id: Uuid) -> Result<()> {
        let mut conn = self.kv.conn();
        let pointer = self.keys.debounce_pointer(&function_id.to_string(), key);
        let current: Option<String> = conn.get(&pointer).await?;
        if current.as_deref() == Some(&id.to_string() as &str) {
            let _: () = conn.del(&pointer).await?;
        }
        let _: () = conn.del(self.keys.debounce(&id.to_string())).await?;
        Ok(())
    }

    async fn set_migrating(&self, id: Uuid, on: bool) -> Result<()> {
        let mut conn = self.kv.conn();
        let key = self.keys.debounce(&id.to_string());
        if on {
            let _: () = conn.hset(&key, "migrating", "1").await?;
        } else {
            let _: () = conn.hdel(&key, "migrating").await?;
        }
        Ok(())
    }
}
