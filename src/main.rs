//! `broadcast-node`: one cluster member speaking JSON lines on stdin/stdout.
//!
//! # Usage
//!
//! ```text
//! broadcast-node                                   # defaults
//! BROADCAST_CONFIG=node.json broadcast-node        # config file
//! RUST_LOG=broadcast_engine=debug broadcast-node   # verbose logs (stderr)
//! ```

use broadcast_engine::{telemetry, transport, BroadcastConfig};
use std::process::ExitCode;
use tracing::{error, info};

/// Environment variable naming a JSON config file.
const CONFIG_ENV: &str = "BROADCAST_CONFIG";

#[tokio::main]
async fn main() -> ExitCode {
    let config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => match BroadcastConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                telemetry::init("info");
                error!(error = %e, "Failed to load configuration");
                return ExitCode::FAILURE;
            }
        },
        None => BroadcastConfig::default(),
    };

    telemetry::init(&config.log_level);
    info!(
        propagation = ?config.settings.propagation.mode,
        topology = ?config.settings.topology.mode,
        anti_entropy_interval = %config.settings.anti_entropy.interval,
        "Starting broadcast node"
    );

    match transport::run_stdio(config).await {
        Ok(()) => {
            info!("Input closed, exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Node failed");
            ExitCode::FAILURE
        }
    }
}
