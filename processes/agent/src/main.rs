//! 'main' for the Talos agent process

use std::sync::Arc;

use anyhow::Result;
use caryatid_process::Process;
use clap::Parser;
use config::{Config, Environment, File};
use talos_common::messages::Message;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

// External modules
use talos_module_chain_watcher::ChainWatcher;
use talos_module_content_resolver::ContentResolver;
use talos_module_process_supervisor::ProcessSupervisor;
use talos_module_update_orchestrator::UpdateOrchestrator;

use caryatid_module_clock::Clock;

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, value_name = "PATH", default_value = "agent")]
    config: String,
}

/// Standard main
#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();

    // Standard logging, levels from RUST_LOG
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Talos agent process");

    // Read the config
    let config = Arc::new(
        Config::builder()
            .add_source(File::with_name(&args.config))
            .add_source(Environment::with_prefix("TALOS"))
            .build()?,
    );

    // Create the process
    let mut process = Process::<Message>::create(config).await;

    // Register modules
    ChainWatcher::register(&mut process);
    ContentResolver::register(&mut process);
    ProcessSupervisor::register(&mut process);
    UpdateOrchestrator::register(&mut process);

    Clock::<Message>::register(&mut process);

    // Run it
    process.run().await?;

    // Bye!
    info!("Exiting");
    Ok(())
}
