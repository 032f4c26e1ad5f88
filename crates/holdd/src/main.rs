//! holdd - chainhold node daemon
//!
//! Holds this agent's source chain, validates entries authored by others
//! (offline when the author is unreachable), and replicates everything it
//! holds to its peers by gossip.

use clap::Parser;
use holdd::config::Config;
use holdd::server::Server;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    let default_filter = if config.verbose {
        "holdd=debug,chainhold_net=debug"
    } else {
        "holdd=info,chainhold_net=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!("holdd v{} - chainhold node", env!("CARGO_PKG_VERSION"));

    match Server::new(config) {
        Ok(server) => {
            if let Err(e) = server.run().await {
                error!("Server error: {}", e);
                return ExitCode::FAILURE;
            }
        }
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
