// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Strand server binary: `strand dev` and `strand start`.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use strand_server::cli::{Cli, Command};
use strand_server::config::ServerConfig;
use strand_server::service;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file (from the working directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("strand_server=info".parse().unwrap())
                .add_directive("strand_core=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let (dev, args) = match cli.command {
        Command::Dev(args) => (true, args),
        Command::Start(args) => (false, args),
    };

    let config = match ServerConfig::resolve(args.into_overlay()) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        mode = if dev { "dev" } else { "start" },
        host = %config.host,
        port = config.port,
        "starting strand"
    );

    match service::run(config, dev).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server error: {e}");
            ExitCode::FAILURE
        }
    }
}
