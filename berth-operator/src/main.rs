//! The Berth control plane.

mod app;
mod cluster;
mod config;
mod database;
mod dispatcher;
mod error;
#[cfg(test)]
mod fixtures;
mod orchestrator;
mod platform;
mod reconciler;
mod server;
mod utils;
#[cfg(test)]
mod utils_test;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true))
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let metrics = PrometheusBuilder::new()
        .add_global_label("namespace", cfg.namespace.clone())
        .install_recorder()
        .context("error installing prometheus metrics recorder")?;

    tracing::info!(
        http_port = %cfg.http_port,
        namespace = %cfg.namespace,
        registry = %cfg.registry,
        poll_timeout_seconds = cfg.poll_timeout_seconds,
        "starting Berth operator",
    );
    if let Err(err) = App::new(cfg, metrics).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
