// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service assembly: wires the engine, registry and HTTP API together.
//!
//! `dev` and `start` share this path; `dev` (or `--in-memory`) swaps the
//! Redis-backed queue and stores for their in-memory counterparts while
//! keeping the SQL registry, so local runs survive nothing but behave the
//! same.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use strand_core::batch::{BatchBuffer, BatchStore, MemoryBatchStore, RedisBatchStore};
use strand_core::debounce::{Debouncer, MemoryDebounceStore, RedisDebounceStore};
use strand_core::executor::{Executor, HttpDriver};
use strand_core::function::key_expression_hash;
use strand_core::ids;
use strand_core::kv::{KeyGen, RedisHandle};
use strand_core::leases::{ConfigLease, MemoryConfigLease, RedisConfigLease};
use strand_core::lifecycle::LifecycleListener;
use strand_core::pauses::{MemoryPauseStore, PauseStore, RedisPauseStore};
use strand_core::queue::{ConcurrencyKey, ConcurrencyLimitGetter, MemoryQueue, Queue, RedisQueue};
use strand_core::ratelimit::{MemoryRateLimiter, RateLimiter, RedisRateLimiter};
use strand_core::runner::Runner;
use strand_core::runtime::EngineRuntime;
use strand_core::state::{MemoryStateStore, RedisStateStore, RunIdentifier, StateLimits, StateStore};

use crate::api::{self, ApiState};
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::registry::{PostgresRegistry, Registry, SharedFunctions, SqliteRegistry};

/// Key prefix for all engine Redis keys.
const REDIS_PREFIX: &str = "strand";

/// Run the server until interrupted.
pub async fn run(config: ServerConfig, dev: bool) -> Result<()> {
    let service = Service::build(config, dev).await?;
    service.serve().await
}

/// A fully wired server, ready to serve.
pub struct Service {
    config: ServerConfig,
    state: ApiState,
    runtime: EngineRuntime,
}

impl Service {
    /// Wire backends, engine and API state from the resolved config.
    pub async fn build(config: ServerConfig, dev: bool) -> Result<Self> {
        let in_memory = dev || config.in_memory;

        let registry: Arc<dyn Registry> = match &config.postgres_uri {
            Some(uri) => Arc::new(PostgresRegistry::connect(uri).await?),
            None => Arc::new(SqliteRegistry::from_dir(&config.sqlite_dir).await?),
        };

        let functions = SharedFunctions::new();
        let limits: Arc<dyn ConcurrencyLimitGetter> = Arc::new(LoaderLimits(functions.clone()));
        let loader = Arc::new(functions.clone());

        let signing_key = match config.signing_key.is_empty() {
            true => None,
            false => Some(hex::decode(&config.signing_key).map_err(|e| {
                ServerError::Config(format!("signing key must be hex-encoded: {e}"))
            })?),
        };

        let backends = if in_memory {
            tracing::info!("using in-memory queue and state backends");
            let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new(limits));
            Backends {
                queue: queue.clone(),
                state: Arc::new(MemoryStateStore::new(StateLimits::default())),
                pauses: Arc::new(MemoryPauseStore::new()),
                batches: Arc::new(MemoryBatchStore::new()),
                debouncer: Debouncer::new(Arc::new(MemoryDebounceStore::new()), queue),
                limiter: Arc::new(MemoryRateLimiter::new()),
                leases: Arc::new(MemoryConfigLease::new()),
            }
        } else {
            let kv = RedisHandle::connect(&config.redis_uri).await?;
            let keys = KeyGen::new(REDIS_PREFIX);
            let queue: Arc<dyn Queue> =
                Arc::new(RedisQueue::new(kv.clone(), keys.clone(), limits));
            Backends {
                queue: queue.clone(),
                state: Arc::new(RedisStateStore::new(kv.clone(), keys.clone(), StateLimits::default())),
                pauses: Arc::new(RedisPauseStore::new(kv.clone(), keys.clone())),
                // High-frequency appends coalesce locally into one bulk
                // script call; callers still block until Redis commits.
                batches: Arc::new(BatchBuffer::new(Arc::new(RedisBatchStore::new(
                    kv.clone(),
                    keys.clone(),
                )))),
                debouncer: Debouncer::new(
                    Arc::new(RedisDebounceStore::new(kv.clone(), keys.clone())),
                    queue,
                ),
                limiter: Arc::new(RedisRateLimiter::new(kv.clone(), keys.clone())),
                leases: Arc::new(RedisConfigLease::new(kv, keys)),
            }
        };

        let history = Arc::new(RunHistoryListener::new(registry.clone()));

        let mut runner = Runner::new(
            backends.queue.clone(),
            backends.state.clone(),
            backends.pauses.clone(),
            backends.batches.clone(),
            backends.debouncer,
            loader.clone(),
            backends.limiter.clone(),
        );
        runner.add_listener(history.clone());
        let runner = Arc::new(runner);

        let mut executor = Executor::new(
            backends.queue.clone(),
            backends.state.clone(),
            backends.pauses.clone(),
            Arc::new(HttpDriver::new(signing_key)),
            loader,
            runner.clone(),
        );
        executor.add_listener(history);
        let executor = Arc::new(executor);

        let runtime = EngineRuntime::builder()
            .queue(backends.queue.clone())
            .executor(executor)
            .runner(runner.clone())
            .leases(backends.leases.clone())
            .worker_count(config.queue_workers)
            .poll_interval(config.tick)
            .build()
            .map_err(|e| ServerError::Config(e.to_string()))?
            .start()
            .await
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let state = ApiState {
            runner,
            registry,
            functions,
            event_keys: config.event_keys.clone(),
            retry_interval: config.retry_interval,
        };
        let cached = state.refresh_functions().await?;
        tracing::info!(functions = cached, "registry loaded");

        Ok(Self { config, state, runtime })
    }

    /// API state, exposed for tests.
    pub fn api_state(&self) -> &ApiState {
        &self.state
    }

    /// Serve the HTTP API until ctrl-c, then drain the engine.
    pub async fn serve(self) -> Result<()> {
        let discovery = spawn_discovery(&self.config, self.state.clone());

        let router = api::router(self.state);
        let listener =
            tokio::net::TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        tracing::info!(host = %self.config.host, port = self.config.port, "listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
            })
            .await?;

        if let Some(task) = discovery {
            task.abort();
        }
        self.runtime.shutdown().await.map_err(|e| ServerError::Config(e.to_string()))?;
        Ok(())
    }
}

/// Engine storage backends, memory or Redis.
struct Backends {
    queue: Arc<dyn Queue>,
    state: Arc<dyn StateStore>,
    pauses: Arc<dyn PauseStore>,
    batches: Arc<dyn BatchStore>,
    debouncer: Debouncer,
    limiter: Arc<dyn RateLimiter>,
    leases: Arc<dyn ConfigLease>,
}

/// Reads current concurrency limits from the function cache at lease time.
struct LoaderLimits(SharedFunctions);

impl ConcurrencyLimitGetter for LoaderLimits {
    fn limit_for(&self, function_id: Uuid, gate: &ConcurrencyKey) -> Option<u32> {
        use strand_core::function::FunctionLoader;
        let function = self.0.function(function_id)?;
        function
            .concurrency
            .iter()
            .find(|c| {
                c.scope == gate.scope
                    && match &c.key {
                        None => gate.expression_hash.is_empty(),
                        Some(expr) => key_expression_hash(expr) == gate.expression_hash,
                    }
            })
            .map(|c| c.limit)
    }
}

/// Writes run history rows from engine lifecycle hooks. Failures are logged
/// and swallowed; history never blocks execution.
pub struct RunHistoryListener {
    registry: Arc<dyn Registry>,
}

impl RunHistoryListener {
    /// Wrap a registry.
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    async fn set_status(
        &self,
        id: &RunIdentifier,
        status: &str,
        ended: bool,
        output: Option<&Value>,
    ) {
        let ended_at = ended.then(|| ids::now_ms() as i64);
        if let Err(e) = self.registry.record_run_status(id.run_id, status, ended_at, output).await
        {
            tracing::warn!(run_id = %id.run_id, error = %e, "run history write failed");
        }
    }
}

#[async_trait::async_trait]
impl LifecycleListener for RunHistoryListener {
    async fn on_run_scheduled(&self, id: &RunIdentifier) {
        if let Err(e) = self.registry.record_run_scheduled(id, ids::now_ms() as i64).await {
            tracing::warn!(run_id = %id.run_id, error = %e, "run history write failed");
        }
    }

    async fn on_run_started(&self, id: &RunIdentifier) {
        self.set_status(id, "running", false, None).await;
    }

    async fn on_run_finished(&self, id: &RunIdentifier, output: &Value) {
        self.set_status(id, "completed", true, Some(output)).await;
    }

    async fn on_run_failed(&self, id: &RunIdentifier, error: &Value) {
        self.set_status(id, "failed", true, Some(error)).await;
    }

    async fn on_run_cancelled(&self, id: &RunIdentifier) {
        self.set_status(id, "cancelled", true, None).await;
    }
}

/// Ping each SDK endpoint so it registers its functions, repeating on the
/// poll interval unless `--no-poll` was set. Returns `None` when discovery
/// is disabled or there is nothing to ping.
fn spawn_discovery(config: &ServerConfig, state: ApiState) -> Option<tokio::task::JoinHandle<()>> {
    if config.no_discovery || config.sdk_urls.is_empty() {
        return None;
    }
    let urls = config.sdk_urls.clone();
    let once = config.no_poll;
    let interval = config.poll_interval;
    Some(tokio::spawn(async move {
        let client = reqwest::Client::new();
        loop {
            for url in &urls {
                ping_sdk(&client, url).await;
            }
            // Discovery only pings; the SDK calls back into /fn/register.
            // Refresh covers registrations that raced the ping loop.
            if let Err(e) = state.refresh_functions().await {
                tracing::warn!(error = %e, "function cache refresh failed");
            }
            if once {
                break;
            }
            tokio::time::sleep(interval).await;
        }
    }))
}

/// One discovery ping. A PUT to the SDK's serve endpoint asks it to register
/// its functions with this server.
async fn ping_sdk(client: &reqwest::Client, url: &str) {
    match client.put(url).timeout(Duration::from_secs(10)).send().await {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(url, "sdk discovery ping ok");
        }
        Ok(response) => {
            tracing::warn!(url, status = %response.status(), "sdk discovery ping rejected");
        }
        Err(e) => {
            tracing::warn!(url, error = %e, "sdk discovery ping failed");
        }
    }
}
