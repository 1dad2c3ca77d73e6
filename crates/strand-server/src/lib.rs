// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strand Server - HTTP surface for the durable execution engine
//!
//! The server wraps [`strand_core`]'s engine with everything an operator
//! touches: the event ingestion API, SDK app registration, a SQL registry
//! of apps, function versions and history, and the `strand` CLI.
//!
//! ```text
//!   SDKs ──register──▶ POST /fn/register ─▶ Registry (SQLite/Postgres)
//!                                              │ refresh
//!   Clients ─events──▶ POST /e/{key} ──▶ Runner ◀── SharedFunctions cache
//!                                              │
//!                                        Durable queue ─▶ Executor ─▶ SDKs
//! ```
//!
//! Two modes share this wiring:
//! - `strand dev`: in-memory queue and state, SQLite registry, relaxed auth.
//! - `strand start`: Redis-backed queue and state, SQLite or Postgres
//!   registry, signing and event keys enforced.
//!
//! Configuration resolves flag > `STRAND_*` env > `strand.{json,yaml,yml}`
//! file > default; see [`config`].

#![deny(missing_docs)]

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod registry;
pub mod service;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
