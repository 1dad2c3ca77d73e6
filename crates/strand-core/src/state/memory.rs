// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory run state for dev mode and tests.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::event::TrackedEvent;
use crate::ids;

use super::{RUN_RETENTION, RunMetadata, RunStatus, StateLimits, StateStore};

struct RunState {
    metadata: RunMetadata,
    events: Vec<TrackedEvent>,
    steps: HashMap<String, Value>,
    stack: Vec<String>,
    state_size: usize,
    delete_at_ms: Option<u64>,
}

/// Run state held entirely in process memory.
pub struct MemoryStateStore {
    runs: Mutex<HashMap<Uuid, RunState>>,
    idempotency: Mutex<HashMap<String, Uuid>>,
    limits: StateLimits,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new(StateLimits::default())
    }
}

impl MemoryStateStore {
    /// A memory store with the given limits.
    pub fn new(limits: StateLimits) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            idempotency: Mutex::new(HashMap::new()),
            limits,
        }
    }

    /// Number of stored runs. Diagnostic.
    pub fn run_count(&self) -> usize {
        self.lock_runs().len()
    }

    /// Lock the run map, dropping runs whose retention has lapsed.
    fn lock_runs(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RunState>> {
        let mut runs = self.runs.lock().unwrap();
        let now = ids::now_ms();
        runs.retain(|_, r| r.delete_at_ms.is_none_or(|t| t > now));
        runs
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn create_run(
        &self,
        metadata: &RunMetadata,
        events: &[TrackedEvent],
        idempotency_key: Option<&str>,
    ) -> Result<()> {
        let run_id = metadata.identifier.run_id;
        if let Some(key) = idempotency_key {
            let mut idem = self.idempotency.lock().unwrap();
            if idem.contains_key(key) {
                return Err(EngineError::RunExists(run_id.to_string()));
            }
            idem.insert(key.to_string(), run_id);
        }
        let mut runs = self.lock_runs();
        if runs.contains_key(&run_id) {
            return Err(EngineError::RunExists(run_id.to_string()));
        }
        runs.insert(
            run_id,
            RunState {
                metadata: metadata.clone(),
                events: events.to_vec(),
                steps: HashMap::new(),
                stack: Vec::new(),
                state_size: 0,
                delete_at_ms: None,
            },
        );
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<RunMetadata> {
        self.lock_runs()
            .get(&run_id)
            .map(|r| r.metadata.clone())
            .ok_or_else(|| EngineError::Validation {
                field: "run_id".to_string(),
                message: format!("run '{run_id}' not found"),
            })
    }

    async fn load_events(&self, run_id: Uuid) -> Result<Vec<TrackedEvent>> {
        Ok(self
            .lock_runs()
            .get(&run_id)
            .map(|r| r.events.clone())
            .unwrap_or_default())
    }

    async fn save_step(&self, run_id: Uuid, step_id: &str, output: &Value) -> Result<()> {
        let mut runs = self.lock_runs();
        let run = runs.get_mut(&run_id).ok_or_else(|| EngineError::Validation {
            field: "run_id".to_string(),
            message: format!("run '{run_id}' not found"),
        })?;
        if run.steps.contains_key(step_id) {
            return Err(EngineError::StepAlreadyExists {
                run_id: run_id.to_string(),
                step_id: step_id.to_string(),
            });
        }
        if run.steps.len() >= self.limits.max_steps {
            return Err(EngineError::StepLimitExceeded {
                run_id: run_id.to_string(),
                limit: self.limits.max_steps,
            });
        }
        let size = serde_json::to_string(output)?.len();
        if run.state_size + size > self.limits.max_bytes {
            return Err(EngineError::StateSizeLimitExceeded {
                run_id: run_id.to_string(),
                limit: self.limits.max_bytes,
            });
        }
        run.steps.insert(step_id.to_string(), output.clone());
        run.stack.push(step_id.to_string());
        run.state_size += size;
        Ok(())
    }

    async fn steps(&self, run_id: Uuid) -> Result<HashMap<String, Value>> {
        Ok(self
            .lock_runs()
            .get(&run_id)
            .map(|r| r.steps.clone())
            .unwrap_or_default())
    }

    async fn stack(&self, run_id: Uuid) -> Result<Vec<String>> {
        Ok(self
            .lock_runs()
            .get(&run_id)
            .map(|r| r.stack.clone())
            .unwrap_or_default())
    }

    async fn set_status(&self, run_id: Uuid, status: RunStatus, now_ms: u64) -> Result<()> {
        let mut runs = self.lock_runs();
        if let Some(run) = runs.get_mut(&run_id) {
            if run.metadata.status.is_terminal() {
                return Ok(());
            }
            run.metadata.status = status;
            if status == RunStatus::Running && run.metadata.started_at_ms.is_none() {
                run.metadata.started_at_ms = Some(now_ms);
            }
            if status.is_terminal() {
                run.metadata.ended_at_ms = Some(now_ms);
            }
        }
        Ok(())
    }

    async fn finalize(&self, run_id: Uuid, status: RunStatus, now_ms: u64) -> Result<()> {
        let mut runs = self.lock_runs();
        if let Some(run) = runs.get_mut(&run_id) {
            if run.metadata.status.is_terminal() {
                return Ok(());
            }
            run.metadata.status = status;
            run.metadata.ended_at_ms = Some(now_ms);
            run.delete_at_ms = Some(now_ms + RUN_RETENTION.as_millis() as u64);
        }
        Ok(())
    }

    async fn set_request_version(&self, run_id: Uuid, version: i32) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        if let Some(run) = runs.get_mut(&run_id) {
            run.metadata.request_version = version;
        }
        Ok(())
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<()> {
        self.runs.lock().unwrap().remove(&run_id);
        Ok(())
    }
}
