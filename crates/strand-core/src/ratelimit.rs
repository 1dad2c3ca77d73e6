// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run-creation rate limiting.
//!
//! Fixed-window counting per evaluated key: at most `limit` run creations per
//! `period`. Rate-limited events are dropped, not queued; the caller surfaces
//! `RateLimited` to the producer.

use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::kv::{KeyGen, RedisHandle};

/// Admits or rejects run creations per key and window.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one creation attempt against the key's current window. Returns
    /// `Ok(())` when admitted and `RateLimited` when the window is full.
    async fn admit(&self, key: &str, limit: u32, period: Duration, now_ms: u64) -> Result<()>;
}

/// Redis fixed-window counter. The window key carries its start timestamp and
/// expires one period after the window closes.
pub struct RedisRateLimiter {
    kv: RedisHandle,
    keys: KeyGen,
}

impl RedisRateLimiter {
    /// A limiter over an existing connection.
    pub fn new(kv: RedisHandle, keys: KeyGen) -> Self {
        Self { kv, keys }
    }
}

#[async_trait::async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn admit(&self, key: &str, limit: u32, period: Duration, now_ms: u64) -> Result<()> {
        let period_ms = period.as_millis() as u64;
        let window = now_ms - now_ms % period_ms.max(1);
        let counter = self.keys.rate_limit(key, window);
        let mut conn = self.kv.conn();
        let count: u64 = conn.incr(&counter, 1u64).await?;
        if count == 1 {
            let _: () = conn.pexpire(&counter, (period_ms * 2) as i64).await?;
        }
        if count > limit as u64 {
            return Err(EngineError::RateLimited(key.to_string()));
        }
        Ok(())
    }
}

/// In-memory fixed-window counter for dev mode and tests.
#[derive(Default)]
pub struct MemoryRateLimiter {
    windows: Mutex<HashMap<String, (u64, u64)>>,
}

impl MemoryRateLimiter {
    /// An empty limiter.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn admit(&self, key: &str, limit: u32, period: Duration, now_ms: u64) -> Result<()> {
        let period_ms = period.as_millis() as u64;
        let window = now_ms - now_ms % period_ms.max(1);
        let mut windows = self.windows.lock().unwrap();
        let entry = windows.entry(key.to_string()).or_insert((window, 0));
        if entry.0 != window {
            *entry = (window, 0);
        }
        entry.1 += 1;
        if entry.1 > limit as u64 {
            return Err(EngineError::RateLimited(key.to_string()));
        }
        Ok(())
    }
}
