//! scuttled - Scuttlebutt key/value replication daemon
//!
//! Holds a last-writer-wins key/value replica, accepts replication
//! connections and dials the configured peers.

use clap::Parser;
use scuttlebutt::config::Config;
use scuttlebutt::server::Server;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    init_logging(&config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "scuttled v{} - Scuttlebutt Replication Daemon",
        env!("CARGO_PKG_VERSION")
    );

    let server = match Server::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Install signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            shutdown_server.shutdown();
        }
    });

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn init_logging(config: &Config) {
    let level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "scuttled={level},scuttlebutt={level},scuttlebutt_net={level}"
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
