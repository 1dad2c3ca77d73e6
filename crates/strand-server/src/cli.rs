// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command-line interface for the `strand` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::ConfigOverlay;

/// Strand durable function execution server.
#[derive(Parser, Debug)]
#[command(name = "strand")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Durable function execution platform")]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a development server with in-memory backends and relaxed auth.
    Dev(RunArgs),
    /// Run a production server backed by Redis and SQL.
    Start(RunArgs),
}

/// Flags shared by `dev` and `start`.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Port for the HTTP API.
    #[arg(long)]
    pub port: Option<u16>,

    /// Host interface for the HTTP API.
    #[arg(long)]
    pub host: Option<String>,

    /// SDK endpoint URL to discover functions from. Repeatable, comma-split.
    #[arg(long = "sdk-url", value_delimiter = ',')]
    pub sdk_url: Vec<String>,

    /// Hex signing key for SDK request signatures.
    #[arg(long)]
    pub signing_key: Option<String>,

    /// Accepted event key. Repeatable, comma-split. Empty accepts any key.
    #[arg(long = "event-key", value_delimiter = ',')]
    pub event_key: Vec<String>,

    /// Postgres connection string for the registry.
    #[arg(long)]
    pub postgres_uri: Option<String>,

    /// Redis connection string for queue and state.
    #[arg(long)]
    pub redis_uri: Option<String>,

    /// Directory for the SQLite registry database.
    #[arg(long)]
    pub sqlite_dir: Option<PathBuf>,

    /// Concurrent queue workers.
    #[arg(long)]
    pub queue_workers: Option<usize>,

    /// Queue poll interval in milliseconds.
    #[arg(long)]
    pub tick: Option<u64>,

    /// SDK re-discovery interval in seconds.
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Default retry interval in seconds for functions that set none.
    #[arg(long)]
    pub retry_interval: Option<u64>,

    /// Skip SDK discovery entirely.
    #[arg(long)]
    pub no_discovery: bool,

    /// Sync SDKs once at startup instead of continuously.
    #[arg(long)]
    pub no_poll: bool,

    /// Use in-memory queue and state backends instead of Redis.
    #[arg(long)]
    pub in_memory: bool,
}

impl RunArgs {
    /// Convert flags into a config overlay. Unset flags leave the lower
    /// layers (env, file, defaults) in effect; boolean flags only override
    /// when passed.
    pub fn into_overlay(self) -> ConfigOverlay {
        ConfigOverlay {
            host: self.host,
            port: self.port,
            sdk_url: if self.sdk_url.is_empty() { None } else { Some(self.sdk_url) },
            event_key: if self.event_key.is_empty() { None } else { Some(self.event_key) },
            signing_key: self.signing_key,
            postgres_uri: self.postgres_uri,
            redis_uri: self.redis_uri,
            sqlite_dir: self.sqlite_dir,
            queue_workers: self.queue_workers,
            tick: self.tick,
            poll_interval: self.poll_interval,
            retry_interval: self.retry_interval,
            no_discovery: self.no_discovery.then_some(true),
            no_poll: self.no_poll.then_some(true),
            in_memory: self.in_memory.then_some(true),
        }
    }
}
