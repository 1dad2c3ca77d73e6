// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Config leases: named TTL locks for cluster-singleton background jobs.
//!
//! The cron sweeper and similar periodic tasks run on every instance, but
//! only the instance holding the role's lease does the work. Holders renew at
//! a third of the TTL; a crashed holder's lease simply expires and another
//! instance picks the role up.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::ids;
use crate::kv::{KeyGen, RedisHandle, LEASE_ACQUIRE, LEASE_RELEASE};

/// Suggested renewal interval for a lease of `ttl`.
pub fn renew_interval(ttl: Duration) -> Duration {
    ttl / 3
}

/// Named TTL locks.
#[async_trait::async_trait]
pub trait ConfigLease: Send + Sync {
    /// Acquire or renew the role's lease for this holder. Returns whether the
    /// holder owns the lease afterwards.
    async fn acquire(&self, role: &str, holder: Uuid, ttl: Duration) -> Result<bool>;

    /// Release the role's lease if this holder owns it.
    async fn release(&self, role: &str, holder: Uuid) -> Result<()>;
}

/// Redis-backed config leases.
pub struct RedisConfigLease {
    kv: RedisHandle,
    keys: KeyGen,
}

impl RedisConfigLease {
    /// Leases over an existing connection.
    pub fn new(kv: RedisHandle, keys: KeyGen) -> Self {
        Self { kv, keys }
    }
}

#[async_trait::async_trait]
impl ConfigLease for RedisConfigLease {
    async fn acquire(&self, role: &str, holder: Uuid, ttl: Duration) -> Result<bool> {
        let reply: String = LEASE_ACQUIRE
            .key(self.keys.config_lease(role))
            .arg(holder.to_string())
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut self.kv.conn())
            .await?;
        Ok(reply == "ok")
    }

    async fn release(&self, role: &str, holder: Uuid) -> Result<()> {
        let _: String = LEASE_RELEASE
            .key(self.keys.config_lease(role))
            .arg(holder.to_string())
            .invoke_async(&mut self.kv.conn())
            .await?;
        Ok(())
    }
}

/// In-process config leases for dev mode and tests.
#[derive(Default)]
pub struct MemoryConfigLease {
    roles: Mutex<HashMap<String, (Uuid, u64)>>,
}

impl MemoryConfigLease {
    /// An empty lease table.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ConfigLease for MemoryConfigLease {
    async fn acquire(&self, role: &str, holder: Uuid, ttl: Duration) -> Result<bool> {
        let now_ms = ids::now_ms();
        let mut roles = self.roles.lock().unwrap();
        match roles.get(role) {
            Some((owner, until)) if *owner != holder && *until > now_ms => Ok(false),
            _ => {
                roles.insert(role.to_string(), (holder, now_ms + ttl.as_millis() as u64));
                Ok(true)
            }
        }
    }

    async fn release(&self, role: &str, holder: Uuid) -> Result<()> {
        let mut roles = self.roles.lock().unwrap();
        if roles.get(role).is_some_and(|(owner, _)| *owner == holder) {
            roles.remove(role);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_one_holder_per_role() {
        let leases = MemoryConfigLease::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ttl = Duration::from_secs(30);

        assert!(leases.acquire("cron", a, ttl).await.unwrap());
        assert!(!leases.acquire("cron", b, ttl).await.unwrap());
        // The holder renews freely.
        assert!(leases.acquire("cron", a, ttl).await.unwrap());
        // Different roles are independent.
        assert!(leases.acquire("sweep", b, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_hands_over() {
        let leases = MemoryConfigLease::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let ttl = Duration::from_secs(30);

        assert!(leases.acquire("cron", a, ttl).await.unwrap());
        // Releasing someone else's lease is a no-op.
        leases.release("cron", b).await.unwrap();
        assert!(!leases.acquire("cron", b, ttl).await.unwrap());

        leases.release("cron", a).await.unwrap();
        assert!(leases.acquire("cron", b, ttl).await.unwrap());
    }

    #[test]
    fn test_renew_interval_is_third() {
        assert_eq!(renew_interval(Duration::from_secs(30)), Duration::from_secs(10));
    }
}
