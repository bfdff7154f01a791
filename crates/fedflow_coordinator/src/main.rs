//! Fedflow coordinator binary.
//!
//! Usage:
//!     fedflow-coordinator --bind tcp://127.0.0.1:5600 --enable-async

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

use fedflow_coordinator::config::{CoordinatorArgs, CoordinatorConfig};
use fedflow_coordinator::server::{spawn_ticker, CoordinatorServer};
use fedflow_coordinator::Core;

fn main() -> Result<()> {
    let args = CoordinatorArgs::parse();
    fedflow_logging::init_logging("fedflow-coordinator", args.verbose)?;

    let config = CoordinatorConfig::from_args(&args);
    tracing::info!("Starting Fedflow coordinator");
    tracing::info!("  Bind: {}", config.bind_addr);
    tracing::info!("  Data dir: {}", config.data_dir.display());
    tracing::info!(
        "  Async closure: {} (quorum {}, timeout {:?})",
        config.closer.enabled,
        config.closer.min_updates,
        config.closer.max_duration
    );

    // Startup failures (unusable data dir, unreadable store) are fatal.
    let core = Arc::new(Core::new(config.clone())?);
    tracing::info!("  Current model version: {}", core.current_version());

    // Bind before spawning background work so a taken port exits
    // cleanly without leaving a ticker behind.
    let mut server = CoordinatorServer::bind(Arc::clone(&core), &config.bind_addr)?;

    let ticker = config.closer.enabled.then(|| spawn_ticker(Arc::clone(&core)));

    let result = server.run();

    if let Some(ticker) = ticker {
        ticker.shutdown();
    }
    result
}
