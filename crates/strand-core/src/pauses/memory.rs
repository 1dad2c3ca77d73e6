// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory pause store for dev mode and tests.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, Result};

use super::{Pause, PauseStore, PAUSE_LEASE};

struct Entry {
    pause: Pause,
    consumed: bool,
    resume_data: Option<Value>,
    lease_until_ms: Option<u64>,
}

#[derive(Default)]
struct Inner {
    pauses: HashMap<Uuid, Entry>,
    by_event: HashMap<String, Vec<Uuid>>,
    by_correlation: HashMap<String, Uuid>,
    by_signal: HashMap<String, Uuid>,
}

impl Inner {
    fn remove_entry(&mut self, pause_id: Uuid) -> Option<Pause> {
        let entry = self.pauses.remove(&pause_id)?;
        if let Some(event) = &entry.pause.event {
            if let Some(ids) = self.by_event.get_mut(event) {
                ids.retain(|id| *id != pause_id);
            }
        }
        if let Some(corr) = &entry.pause.correlation_id {
            self.by_correlation.remove(corr);
        }
        if let Some(signal) = &entry.pause.signal {
            self.by_signal.remove(signal);
        }
        Some(entry.pause)
    }
}

/// Pause store held entirely in process memory.
#[derive(Default)]
pub struct MemoryPauseStore {
    inner: Mutex<Inner>,
}

impl MemoryPauseStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PauseStore for MemoryPauseStore {
    async fn save(&self, pause: &Pause) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(event) = &pause.event {
            inner.by_event.entry(event.clone()).or_default().push(pause.id);
        }
        if let Some(corr) = &pause.correlation_id {
            inner.by_correlation.insert(corr.clone(), pause.id);
        }
        if let Some(signal) = &pause.signal {
            inner.by_signal.insert(signal.clone(), pause.id);
        }
        inner.pauses.insert(
            pause.id,
            Entry {
                pause: pause.clone(),
                consumed: false,
                resume_data: None,
                lease_until_ms: None,
            },
        );
        Ok(())
    }

    async fn load(&self, pause_id: Uuid) -> Result<Pause> {
        self.inner
            .lock()
            .unwrap()
            .pauses
            .get(&pause_id)
            .map(|e| e.pause.clone())
            .ok_or_else(|| EngineError::PauseNotFound(pause_id.to_string()))
    }

    async fn resume_data(&self, pause_id: Uuid) -> Result<Option<Value>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .pauses
            .get(&pause_id)
            .and_then(|e| e.resume_data.clone()))
    }

    async fn pauses_by_event(&self, event_name: &str) -> Result<Vec<Pause>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Pause> = inner
            .by_event
            .get(event_name)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.pauses.get(id))
                    .filter(|e| !e.consumed)
                    .map(|e| e.pause.clone())
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|p| p.id);
        Ok(out)
    }

    async fn pause_by_correlation(&self, correlation_id: &str) -> Result<Option<Pause>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .by_correlation
            .get(correlation_id)
            .and_then(|id| inner.pauses.get(id))
            .filter(|e| !e.consumed)
            .map(|e| e.pause.clone()))
    }

    async fn pause_by_signal(&self, signal: &str) -> Result<Option<Pause>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .by_signal
            .get(signal)
            .and_then(|id| inner.pauses.get(id))
            .filter(|e| !e.consumed)
            .map(|e| e.pause.clone()))
    }

    async fn lease(&self, pause_id: Uuid, now_ms: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .pauses
            .get_mut(&pause_id)
            .ok_or_else(|| EngineError::PauseNotFound(pause_id.to_string()))?;
        if entry.consumed {
            return Err(EngineError::PauseConsumed(pause_id.to_string()));
        }
        if let Some(until) = entry.lease_until_ms {
            if until > now_ms {
                return Err(EngineError::AlreadyLeased(pause_id.to_string()));
            }
        }
        entry.lease_until_ms = Some(now_ms + PAUSE_LEASE.as_millis() as u64);
        Ok(())
    }

    async fn consume(&self, pause_id: Uuid, resume_data: &Value) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .pauses
            .get_mut(&pause_id)
            .ok_or_else(|| EngineError::PauseNotFound(pause_id.to_string()))?;
        if entry.consumed {
            return Err(EngineError::PauseConsumed(pause_id.to_string()));
        }
        entry.consumed = true;
        entry.resume_data = Some(resume_data.clone());
        let pause = entry.pause.clone();
        if let Some(event) = &pause.event {
            if let Some(ids) = inner.by_event.get_mut(event) {
                ids.retain(|id| *id != pause_id);
            }
        }
        if let Some(corr) = &pause.correlation_id {
            inner.by_correlation.remove(corr);
        }
        if let Some(signal) = &pause.signal {
            inner.by_signal.remove(signal);
        }
        Ok(())
    }

    async fn delete(&self, pause_id: Uuid) -> Result<()> {
        self.inner.lock().unwrap().remove_entry(pause_id);
        Ok(())
    }

    async fn delete_by_run(&self, run_id: Uuid) -> Result<Vec<Pause>> {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<Uuid> = inner
            .pauses
            .iter()
            .filter(|(_, e)| e.pause.identifier.run_id == run_id)
            .map(|(id, _)| *id)
            .collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(pause) = inner.remove_entry(id) {
                out.push(pause);
            }
        }
        Ok(out)
    }
}
