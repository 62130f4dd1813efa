//! fleetd - development cluster daemon
//!
//! Runs a whole fleet cluster in one process for local development:
//!
//! - **Store**: in-process coordination store with a lease reaper
//! - **Engines**: several scheduling engine candidates racing for leadership
//! - **Agents**: one machine agent per machine in the cluster file, each
//!   with a mock runtime
//! - **Submission**: units from the cluster file are submitted on startup and
//!   the daemon reports where they were scheduled

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_agent::{Agent, MockRuntime};
use fleet_coord::MemoryStore;
use fleet_engine::{EngineConfig, SchedulerWorker};
use fleet_id::EngineId;
use fleet_registry::keys::DEFAULT_ROOT;
use fleet_registry::submit::{DEFAULT_BLOCK_ATTEMPTS, DEFAULT_BLOCK_INTERVAL};
use fleet_registry::{DigestSigner, Registry, RegistryConfig, RegistryError, Submitter};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cluster;

use cluster::ClusterFile;

/// fleetd - run a development fleet cluster in one process.
#[derive(Debug, Parser)]
#[command(name = "fleetd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Cluster file describing machines and units.
    #[arg(long, short = 'c', env = "FLEET_CLUSTER_FILE")]
    cluster: PathBuf,

    /// Number of scheduling engine candidates.
    #[arg(long, env = "FLEET_ENGINES", default_value_t = 2)]
    engines: usize,

    /// Shared key for signing submitted units. Engines only schedule units
    /// that verify against it.
    #[arg(long, env = "FLEET_SIGNING_KEY")]
    signing_key: Option<String>,

    /// Registry key prefix.
    #[arg(long, env = "FLEET_ROOT", default_value = DEFAULT_ROOT)]
    root: String,

    /// Placement polls after submission before reporting units as queued.
    #[arg(long, default_value_t = DEFAULT_BLOCK_ATTEMPTS)]
    block_attempts: u32,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "FLEET_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleetd");

    let cluster = ClusterFile::load(&cli.cluster)?;
    let base_dir = cli
        .cluster
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let agent_configs = cluster.agent_configs()?;
    let units = cluster.units(&base_dir)?;
    let engine_config = EngineConfig::from_env().context("invalid engine configuration")?;
    info!(
        machines = agent_configs.len(),
        units = units.len(),
        engines = cli.engines,
        "Cluster file loaded"
    );

    let store = Arc::new(MemoryStore::new());
    let reaper = store.spawn_reaper(Duration::from_secs(1));
    let registry = Arc::new(Registry::new(
        store,
        RegistryConfig {
            root: cli.root.clone(),
            ..RegistryConfig::default()
        },
    ));
    let signer = cli.signing_key.map(|key| Arc::new(DigestSigner::new(key)));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    for _ in 0..cli.engines {
        let config = EngineConfig {
            engine_id: EngineId::new(),
            ..engine_config.clone()
        };
        let mut worker = SchedulerWorker::new(registry.clone(), config);
        if let Some(signer) = &signer {
            worker = worker.with_verifier(signer.clone());
        }
        let shutdown_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { worker.run(shutdown_rx).await }));
    }

    for config in agent_configs {
        let agent = Agent::new(config, registry.clone(), Arc::new(MockRuntime::new()));
        let shutdown_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { agent.run(shutdown_rx).await }));
    }

    let mut submitter = Submitter::new(registry.clone());
    if let Some(signer) = &signer {
        submitter = submitter.with_signer(signer.clone()).with_verifier(signer.clone());
    }

    let mut submitted = Vec::new();
    for unit in units {
        let name = unit.name.clone();
        match submitter.submit(unit).await {
            Ok(_) => submitted.push(name),
            Err(RegistryError::AlreadyExists(name)) => {
                warn!(unit = %name, "Unit already exists, skipping");
            }
            Err(e) => {
                error!(unit = %name, error = %e, "Failed to submit unit");
            }
        }
    }

    if !submitted.is_empty() {
        match submitter
            .wait_for_scheduled(&submitted, cli.block_attempts, DEFAULT_BLOCK_INTERVAL)
            .await
        {
            Ok(results) => {
                let queued = results.values().filter(|s| !s.is_scheduled()).count();
                info!(scheduled = results.len() - queued, queued, "Initial submission complete");
            }
            Err(e) => warn!(error = %e, "Failed to wait for scheduling"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Worker task panicked");
        }
    }
    reaper.abort();

    info!("fleetd shutdown complete");
    Ok(())
}
