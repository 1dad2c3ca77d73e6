// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory debounce store for dev mode and tests.

use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::event::TrackedEvent;
use crate::ids;

use super::{DebounceStore, Upserted};

struct Entry {
    payload: TrackedEvent,
    created_at_ms: u64,
    started: bool,
    migrating: bool,
}

#[derive(Default)]
struct Inner {
    pointers: HashMap<(Uuid, String), Uuid>,
    debounces: HashMap<Uuid, Entry>,
}

/// Debounce store held entirely in process memory.
#[derive(Default)]
pub struct MemoryDebounceStore {
    inner: Mutex<Inner>,
}

impl MemoryDebounceStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DebounceStore for MemoryDebounceStore {
    async fn upsert(
        &self,
        function_id: Uuid,
        key: &str,
        event: &TrackedEvent,
        now_ms: u64,
    ) -> Result<Upserted> {
        let mut inner = self.inner.lock().unwrap();
        let pointer = (function_id, key.to_string());
        if let Some(id) = inner.pointers.get(&pointer).copied() {
            if let Some(entry) = inner.debounces.get_mut(&id) {
                if entry.migrating {
                    return Err(EngineError::DebounceMigrating(id.to_string()));
                }
                if entry.started {
                    return Err(EngineError::DebounceInProgress(id.to_string()));
                }
                entry.payload = event.clone();
                return Ok(Upserted::Updated { id, created_at_ms: entry.created_at_ms });
            }
        }
        let id = ids::new_id();
        inner.pointers.insert(pointer, id);
        inner.debounces.insert(
            id,
            Entry {
                payload: event.clone(),
                created_at_ms: now_ms,
                started: false,
                migrating: false,
            },
        );
        Ok(Upserted::Created { id })
    }

    async fn start(&self, id: Uuid) -> Result<TrackedEvent> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .debounces
            .get_mut(&id)
            .ok_or_else(|| EngineError::DebounceNotFound(id.to_string()))?;
        if entry.started {
            return Err(EngineError::DebounceNotFound(id.to_string()));
        }
        entry.started = true;
        Ok(entry.payload.clone())
    }

    async fn delete(&self, function_id: Uuid, key: &str, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let pointer = (function_id, key.to_string());
        if inner.pointers.get(&pointer) == Some(&id) {
            inner.pointers.remove(&pointer);
        }
        inner.debounces.remove(&id);
        Ok(())
    }

    async fn set_migrating(&self, id: Uuid, on: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.debounces.get_mut(&id) {
            entry.migrating = on;
        }
        Ok(())
    }
}
