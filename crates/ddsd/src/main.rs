//! ddsd - federated document distribution daemon
//!
//! Serves this node's documents and subscriptions over HTTP, pushes changes
//! to subscribed peers, and periodically audits every configured peer.

use clap::Parser;
use ddsd::config::Config;
use ddsd::server::Node;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let mut config = Config::parse();

    // Initialize logging
    let level = if config.verbose { "ddsd=debug" } else { "ddsd=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!(
        "ddsd v{} - Document Distribution Service",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }
    for warning in config.normalize() {
        warn!("Config: {}", warning);
    }

    let node = match Node::open(config) {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to initialize node: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = node.start().await {
        error!("Failed to start node: {}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");

    if let Err(e) = node.shutdown().await {
        error!("Shutdown error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
