// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-backed pause store.
//!
//! Each pause is a hash (`blob`, `consumed`, `resume_data`, `lease_until`)
//! plus membership in an event-name set and optional correlation/signal
//! pointer keys. Lease and consume are scripted so racing matchers serialize
//! on the server.

use redis::AsyncCommands;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::kv::{self, KeyGen, RedisHandle};

use super::{Pause, PauseStore, PAUSE_LEASE};

/// Pause store over Redis.
pub struct RedisPauseStore {
    kv: RedisHandle,
    keys: KeyGen,
}

impl RedisPauseStore {
    /// Create a store over an existing connection.
    pub fn new(kv: RedisHandle, keys: KeyGen) -> Self {
        Self { kv, keys }
    }

    async fn load_raw(&self, pause_id: Uuid) -> Result<Pause> {
        let mut conn = self.kv.conn();
        let blob: Option<String> =
            conn.hget(self.keys.pause(&pause_id.to_string()), "blob").await?;
        let blob = blob.ok_or_else(|| EngineError::PauseNotFound(pause_id.to_string()))?;
        Ok(serde_json::from_str(&blob)?)
    }
}

#[async_trait::async_trait]
impl PauseStore for RedisPauseStore {
    async fn save(&self, pause: &Pause) -> Result<()> {
        let pid = pause.id.to_string();
        let blob = serde_json::to_string(pause)?;
        let mut conn = self.kv.conn();
        let _: () = conn
            .hset_multiple(self.keys.pause(&pid), &[("blob", blob.as_str()), ("consumed", "0")])
            .await?;
        if let Some(event) = &pause.event {
            let _: () = conn.sadd(self.keys.pause_event_index(event), &pid).await?;
        }
        if let Some(corr) = &pause.correlation_id {
            let _: () = conn.set(self.keys.pause_correlation(corr), &pid).await?;
        }
        if let Some(signal) = &pause.signal {
            let _: () = conn.set(self.keys.pause_signal(signal), &pid).await?;
        }
        let run_id = pause.identifier.run_id.to_string();
        let _: () = conn.sadd(self.keys.pause_run_index(&run_id), &pid).await?;
        Ok(())
    }

    async fn load(&self, pause_id: Uuid) -> Result<Pause> {
        self.load_raw(pause_id).await
    }

    async fn resume_data(&self, pause_id: Uuid) -> Result<Option<Value>> {
        let mut conn = self.kv.conn();
        let data: Option<String> =
            conn.hget(self.keys.pause(&pause_id.to_string()), "resume_data").await?;
        match data {
            Some(blob) => Ok(Some(serde_json::from_str(&blob)?)),
            None => Ok(None),
        }
    }

    async fn pauses_by_event(&self, event_name: &str) -> Result<Vec<Pause>> {
        let mut conn = self.kv.conn();
        let ids: Vec<String> = conn.smembers(self.keys.pause_event_index(event_name)).await?;
        let mut out = Vec::with_capacity(ids.len());
        for pid in ids {
            let Ok(id) = Uuid::parse_str(&pid) else { continue };
            match self.load_raw(id).await {
                Ok(pause) => out.push(pause),
                Err(EngineError::PauseNotFound(_)) => {
                    // Stale index entry; pause already deleted.
                    let _: () = conn.srem(self.keys.pause_event_index(event_name), &pid).await?;
                }
                Err(e) => return Err(e),
            }
        }
        // Creation order for deterministic match order across workers.
        out.sort_by_key(|p| p.id);
        Ok(out)
    }

    async fn pause_by_correlation(&self, correlation_id: &str) -> Result<Option<Pause>> {
        let mut conn = self.kv.conn();
        let pid: Option<String> = conn.get(self.keys.pause_correlation(correlation_id)).await?;
        match pid.and_then(|p| Uuid::parse_str(&p).ok()) {
            Some(id) => Ok(Some(self.load_raw(id).await?)),
            None => Ok(None),
        }
    }

    async fn pause_by_signal(&self, signal: &str) -> Result<Option<Pause>> {
        let mut conn = self.kv.conn();
        let pid: Option<String> = conn.get(self.keys.pause_signal(signal)).await?;
        match pid.and_then(|p| Uuid::parse_str(&p).ok()) {
            Some(id) => Ok(Some(self.load_raw(id).await?)),
            None => Ok(None),
        }
    }

    async fn lease(&self, pause_id: Uuid, now_ms: u64) -> Result<()> {
        let mut conn = self.kv.conn();
        let reply: String = kv::PAUSE_LEASE
            .key(self.keys.pause(&pause_id.to_string()))
            .arg(now_ms)
            .arg(now_ms + PAUSE_LEASE.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        match reply.as_str() {
            "ok" => Ok(()),
            "missing" => Err(EngineError::PauseNotFound(pause_id.to_string())),
            "consumed" => Err(EngineError::PauseConsumed(pause_id.to_string())),
            "leased" => Err(EngineError::AlreadyLeased(pause_id.to_string())),
            other => Err(EngineError::ScriptError {
                script: "pause_lease".to_string(),
                message: other.to_string(),
            }),
        }
    }

    async fn consume(&self, pause_id: Uuid, resume_data: &Value) -> Result<()> {
        let pause = self.load_raw(pause_id).await?;
        let pid = pause_id.to_string();
        let blob = serde_json::to_string(resume_data)?;

        // Unused index slots get the pause key as a placeholder; the flags
        // stop the script from touching them.
        let pause_key = self.keys.pause(&pid);
        let event_key = pause
            .event
            .as_deref()
            .map(|e| self.keys.pause_event_index(e))
            .unwrap_or_else(|| pause_key.clone());
        let corr_key = pause
            .correlation_id
            .as_deref()
            .map(|c| self.keys.pause_correlation(c))
            .unwrap_or_else(|| pause_key.clone());
        let signal_key = pause
            .signal
            .as_deref()
            .map(|s| self.keys.pause_signal(s))
            .unwrap_or_else(|| pause_key.clone());

        let mut conn = self.kv.conn();
        let reply: String = kv::PAUSE_CONSUME
            .key(&pause_key)
            .key(&event_key)
            .key(&corr_key)
            .key(&signal_key)
            .arg(&pid)
            .arg(&blob)
            .arg(if pause.event.is_some() { "1" } else { "0" })
            .arg(if pause.correlation_id.is_some() { "1" } else { "0" })
            .arg(if pause.signal.is_some() { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        match reply.as_str() {
            "ok" => Ok(()),
            "missing" => Err(EngineError::PauseNotFound(pid)),
            "consumed" => Err(EngineError::PauseConsumed(pid)),
            other => Err(EngineError::ScriptError {
                script: "pause_consume".to_string(),
                message: other.to_string(),
            }),
        }
    }

    async fn delete(&self, pause_id: Uuid) -> Result<()> {
        let pause = match self.load_raw(pause_id).await {
            Ok(p) => p,
            Err(EngineError::PauseNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let pid = pause_id.to_string();
        let mut conn = self.kv.conn();
        if let Some(event) = &pause.event {
            let _: () = conn.srem(self.keys.pause_event_index(event), &pid).await?;
        }
        if let Some(corr) = &pause.correlation_id {
            let _: () = conn.del(self.keys.pause_correlation(corr)).await?;
        }
        if let Some(signal) = &pause.signal {
            let _: () = conn.del(self.keys.pause_signal(signal)).await?;
        }
        let run_id = pause.identifier.run_id.to_string();
        let _: () = conn.srem(self.keys.pause_run_index(&run_id), &pid).await?;
        let _: () = conn.del(self.keys.pause(&pid)).await?;
        Ok(())
    }

    async fn delete_by_run(&self, run_id: Uuid) -> Result<Vec<Pause>> {
        let run_index = self.keys.pause_run_index(&run_id.to_string());
        let mut conn = self.kv.conn();
        let ids: Vec<String> = conn.smembers(&run_index).await?;
        let mut out = Vec::with_capacity(ids.len());
        for pid in ids {
            let Ok(id) = Uuid::parse_str(&pid) else { continue };
            match self.load_raw(id).await {
                Ok(pause) => {
                    self.delete(id).await?;
                    out.push(pause);
                }
                // Stale index entry; pause already deleted.
                Err(EngineError::PauseNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let _: () = conn.del(&run_index).await?;
        Ok(out)
    }
}
