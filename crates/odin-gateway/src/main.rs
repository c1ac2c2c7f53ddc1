// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use odin_gateway::config::GatewayConfig;
use odin_gateway::{AppState, build_router};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "odin-gateway", version, about = "ODIN gateway daemon")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8484")]
    bind: String,

    /// Enable request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("odin=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("odin=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = GatewayConfig::from_env();
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;

    let state = AppState::build(config).context("wire gateway subsystems")?;
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(
        bind = %args.bind,
        external_url = %state.config.external_url,
        storage = state.storage.name(),
        "odin-gateway listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
