// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine runtime.
//!
//! This module provides [`EngineRuntime`] which runs the queue poller, the
//! worker pool and the cron sweeper inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use strand_core::runtime::EngineRuntime;
//!
//! let runtime = EngineRuntime::builder()
//!     .queue(queue)
//!     .executor(executor)
//!     .runner(runner)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // ... serve traffic ...
//!
//! runtime.shutdown().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::executor::Executor;
use crate::ids;
use crate::leases::{renew_interval, ConfigLease};
use crate::queue::{ItemKind, LeaseId, Queue, QueueItem, BACKLOG_COOLOFF, DEFAULT_LEASE};
use crate::runner::Runner;

/// How many partitions one poll inspects.
const PARTITION_PEEK: usize = 10;

/// How many items one poll takes from a single partition.
const ITEM_PEEK: usize = 20;

/// TTL of the cron sweeper's config lease.
const CRON_LEASE_TTL: Duration = Duration::from_secs(90);

/// Role name of the cron sweeper lease.
const CRON_ROLE: &str = "cron";

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    queue: Option<Arc<dyn Queue>>,
    executor: Option<Arc<Executor>>,
    runner: Option<Arc<Runner>>,
    leases: Option<Arc<dyn ConfigLease>>,
    worker_count: usize,
    poll_interval: Duration,
    lease_duration: Duration,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("queue", &self.queue.as_ref().map(|_| "..."))
            .field("worker_count", &self.worker_count)
            .field("poll_interval", &self.poll_interval)
            .field("lease_duration", &self.lease_duration)
            .finish()
    }
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            queue: None,
            executor: None,
            runner: None,
            leases: None,
            worker_count: 100,
            poll_interval: Duration::from_millis(100),
            lease_duration: DEFAULT_LEASE,
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the work queue (required).
    pub fn queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the executor (required).
    pub fn executor(mut self, executor: Arc<Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the runner (required).
    pub fn runner(mut self, runner: Arc<Runner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Enable the cron sweeper behind a config lease.
    pub fn leases(mut self, leases: Arc<dyn ConfigLease>) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Number of concurrently processing workers.
    ///
    /// Default: 100
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Queue poll interval.
    ///
    /// Default: 100ms
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Item lease duration.
    ///
    /// Default: 20s
    pub fn lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let queue = self.queue.ok_or_else(|| anyhow::anyhow!("queue is required"))?;
        let executor = self.executor.ok_or_else(|| anyhow::anyhow!("executor is required"))?;
        let runner = self.runner.ok_or_else(|| anyhow::anyhow!("runner is required"))?;
        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be at least 1");
        }

        Ok(EngineRuntimeConfig {
            queue,
            executor,
            runner,
            leases: self.leases,
            worker_count: self.worker_count,
            poll_interval: self.poll_interval,
            lease_duration: self.lease_duration,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    queue: Arc<dyn Queue>,
    executor: Arc<Executor>,
    runner: Arc<Runner>,
    leases: Option<Arc<dyn ConfigLease>>,
    worker_count: usize,
    poll_interval: Duration,
    lease_duration: Duration,
}

impl EngineRuntimeConfig {
    /// Start the runtime, spawning the poller and cron sweeper tasks.
    pub async fn start(self) -> Result<EngineRuntime> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles = Vec::new();
        handles.push(tokio::spawn(run_poller(
            self.queue.clone(),
            self.executor.clone(),
            self.runner.clone(),
            self.worker_count,
            self.poll_interval,
            self.lease_duration,
            shutdown_rx.clone(),
        )));

        if let Some(leases) = self.leases.clone() {
            handles.push(tokio::spawn(run_cron_sweeper(
                leases,
                self.runner.clone(),
                shutdown_rx,
            )));
        }

        info!(workers = self.worker_count, "EngineRuntime started");

        Ok(EngineRuntime { handles, shutdown_tx })
    }
}

/// A running engine: queue poller, worker pool and cron sweeper.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination; in-flight
/// items finish, unfinished leases expire and are retried elsewhere.
pub struct EngineRuntime {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Gracefully shut down the runtime.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("runtime task panicked: {e}");
                return Err(anyhow::anyhow!("runtime task panicked: {e}"));
            }
        }
        info!("EngineRuntime shutdown complete");
        Ok(())
    }
}

/// The poll loop: lease ready items and hand them to the worker pool.
async fn run_poller(
    queue: Arc<dyn Queue>,
    executor: Arc<Executor>,
    runner: Arc<Runner>,
    worker_count: usize,
    poll_interval: Duration,
    lease_duration: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let workers = Arc::new(Semaphore::new(worker_count));
    let mut tick = tokio::time::interval(poll_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("queue poller received shutdown signal");
                    break;
                }
            }

            _ = tick.tick() => {
                if let Err(e) =
                    poll_once(&queue, &executor, &runner, &workers, lease_duration).await
                {
                    warn!(error = %e, "queue poll failed");
                }
            }
        }
    }

    // Let in-flight workers drain before returning.
    let _ = workers.acquire_many(worker_count as u32).await;
    info!("queue poller stopped");
}

async fn poll_once(
    queue: &Arc<dyn Queue>,
    executor: &Arc<Executor>,
    runner: &Arc<Runner>,
    workers: &Arc<Semaphore>,
    lease_duration: Duration,
) -> crate::error::Result<()> {
    let now_ms = ids::now_ms();
    let partitions = queue.peek_partitions(now_ms, PARTITION_PEEK).await?;
    for partition in partitions {
        let items = queue.peek(&partition.key, now_ms, ITEM_PEEK).await?;
        if items.is_empty() {
            continue;
        }
        let mut blocked = 0usize;
        let total = items.len();
        for item in items {
            match queue.lease(&item.id, lease_duration, now_ms).await {
                Ok(lease) => {
                    let permit = match workers.clone().acquire_owned().await {
                        Ok(p) => p,
                        // Closed only on shutdown.
                        Err(_) => return Ok(()),
                    };
                    let executor = executor.clone();
                    let runner = runner.clone();
                    tokio::spawn(async move {
                        route_item(&executor, &runner, item, lease).await;
                        drop(permit);
                    });
                }
                Err(EngineError::ConcurrencyLimited(key)) => {
                    debug!(item = %item.id, key, "concurrency limited");
                    blocked += 1;
                }
                Err(EngineError::AlreadyLeased(_) | EngineError::NoneReady) => {}
                Err(e) => warn!(item = %item.id, error = %e, "lease failed"),
            }
        }
        // Everything leasable was gated; cool the partition off so the poll
        // loop stops revisiting it.
        if blocked == total {
            queue
                .backoff_partition(&partition.key, now_ms + BACKLOG_COOLOFF.as_millis() as u64)
                .await?;
        }
    }
    Ok(())
}

/// Route one leased item to the component that owns its kind.
async fn route_item(executor: &Executor, runner: &Runner, item: QueueItem, lease: LeaseId) {
    let result = match item.kind {
        ItemKind::ScheduleBatch | ItemKind::Debounce => runner.process(&item, lease).await,
        _ => executor.process(&item, lease).await,
    };
    if let Err(e) = result {
        // The lease expires and the item returns to pending.
        warn!(item = %item.id, kind = ?item.kind, error = %e, "item processing failed");
    }
}

/// The cron sweeper: one instance per cluster schedules due cron runs.
async fn run_cron_sweeper(
    leases: Arc<dyn ConfigLease>,
    runner: Arc<Runner>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let holder = Uuid::new_v4();
    let tick_interval = renew_interval(CRON_LEASE_TTL);
    let mut tick = tokio::time::interval(tick_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("cron sweeper received shutdown signal");
                    break;
                }
            }

            _ = tick.tick() => {
                match leases.acquire(CRON_ROLE, holder, CRON_LEASE_TTL).await {
                    Ok(true) => {
                        let horizon = tick_interval * 2;
                        match runner.tick_cron(ids::now_ms(), horizon).await {
                            Ok(scheduled) if !scheduled.is_empty() => {
                                debug!(count = scheduled.len(), "cron runs scheduled");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "cron sweep failed"),
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "cron lease acquire failed"),
                }
            }
        }
    }

    if let Err(e) = leases.release(CRON_ROLE, holder).await {
        warn!(error = %e, "cron lease release failed");
    }
    info!("cron sweeper stopped");
}
