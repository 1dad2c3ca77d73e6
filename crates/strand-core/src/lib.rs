// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strand Core - Durable Function Execution Engine
//!
//! This crate provides the execution engine for durable functions. Events flow
//! in, runs are scheduled on a partitioned time-ordered queue, and steps are
//! dispatched to SDK endpoints over HTTP. Step outputs are memoized so a crash
//! at any point replays the function to where it left off.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Event Sources                                  │
//! │                 (strand-server API, SDKs, cron sweeper)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ events
//!                                    ▼
//! ┌───────────────────────┐  resolves pauses,  ┌─────────────────────────────┐
//! │       Runner          │  batches, debounces│        Pause Store          │
//! │  trigger matching     │◄──────────────────►│  waitForEvent / invoke /    │
//! │  run scheduling       │                    │  signals / cancel triggers  │
//! └──────────┬────────────┘                    └─────────────────────────────┘
//!            │ enqueues
//!            ▼
//! ┌───────────────────────┐   leases   ┌───────────────────────┐
//! │    Durable Queue      │───────────►│       Executor        │
//! │  per-function parts,  │            │  replay + dispatch,   │
//! │  priority by time,    │            │  opcode handling,     │
//! │  concurrency gates    │            │  retries / finalize   │
//! └───────────────────────┘            └──────────┬────────────┘
//!                                                 │ HTTP (signed)
//!                                                 ▼
//!                                      ┌───────────────────────┐
//!                                      │     SDK Endpoints     │
//!                                      │  (user applications)  │
//!                                      └───────────────────────┘
//! ```
//!
//! Every store has two implementations: Redis/Valkey via Lua scripts for
//! production and an in-process memory store for dev mode and tests. The
//! [`runtime::EngineRuntime`] ties the pieces together: a queue poller, a
//! bounded worker pool and a lease-guarded cron sweeper.
//!
//! # Run Lifecycle
//!
//! ```text
//!                ┌───────────┐
//!                │ Scheduled │
//!                └─────┬─────┘
//!                      │ first dispatch
//!                      ▼
//!                ┌───────────┐
//!      ┌─────────│  Running  │─────────┐
//!      │         └─────┬─────┘         │
//!  complete         retries         cancel
//!      │          exhausted            │
//!      ▼               ▼               ▼
//! ┌───────────┐  ┌───────────┐  ┌───────────┐
//! │ Completed │  │  Failed   │  │ Cancelled │
//! └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Modules
//!
//! - [`backoff`]: retry delay schedules (capped exponential with jitter, linear)
//! - [`batch`]: event batching with atomic claim-on-full
//! - [`debounce`]: trailing-edge event debouncing
//! - [`error`]: error taxonomy with stable machine-readable codes
//! - [`event`]: event envelope, system events, tracked IDs
//! - [`executor`]: step dispatch, opcode handling, retries, finalization
//! - [`function`]: function definitions and deterministic identity
//! - [`ids`]: UUIDv7 construction and timestamp extraction
//! - [`kv`]: Redis connection handling, key namespace, Lua script registry
//! - [`leases`]: named TTL locks for cluster-singleton roles
//! - [`lifecycle`]: observer hooks for run and step transitions
//! - [`pauses`]: durable waits (events, invocations, signals, cancellation)
//! - [`queue`]: the partitioned priority-by-time work queue
//! - [`ratelimit`]: fixed-window run-creation rate limiting
//! - [`runner`]: event ingestion, trigger matching, run scheduling
//! - [`runtime`]: poller, worker pool and cron sweeper as one embeddable unit
//! - [`state`]: run metadata, memoized step outputs, the replay stack

#![deny(missing_docs)]

pub mod backoff;
pub mod batch;
pub mod debounce;
pub mod error;
pub mod event;
pub mod executor;
pub mod function;
pub mod ids;
pub mod kv;
pub mod leases;
pub mod lifecycle;
pub mod pauses;
pub mod queue;
pub mod ratelimit;
pub mod runner;
pub mod runtime;
pub mod state;

pub use error::{EngineError, Result};
