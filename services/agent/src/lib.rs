//! fleet machine agent
//!
//! One agent runs per machine. It keeps the machine record alive under a
//! lease, watches the placements that target its machine and converges the
//! local runtime towards each unit's target state, reporting every state
//! transition back to the registry.
//!
//! The agent never decides placement. It acts only on placements the
//! scheduling engine wrote for its machine, and only ever clears its own
//! runtime records.

pub mod config;
mod error;
pub mod heartbeat;
pub mod reconciler;
pub mod runtime;
pub mod units;

use std::sync::Arc;

use fleet_registry::AgentRegistry;
use tokio::sync::{watch, Notify};
use tracing::{error, info};

pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
pub use heartbeat::{run_heartbeat_loop, Beat, MachineLease};
pub use reconciler::{AgentReconciler, ReconcilerConfig};
pub use runtime::{MockRuntime, UnitRuntime};
pub use units::{LocalUnit, UnitManager};

/// A machine agent: heartbeat plus reconciler.
pub struct Agent {
    config: AgentConfig,
    registry: Arc<dyn AgentRegistry>,
    reconciler: Arc<AgentReconciler>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        registry: Arc<dyn AgentRegistry>,
        runtime: Arc<dyn UnitRuntime>,
    ) -> Self {
        let reconciler = AgentReconciler::new(
            registry.clone(),
            runtime,
            Arc::new(UnitManager::new()),
            config.machine_id.clone(),
            ReconcilerConfig::from(&config),
        );
        Self {
            config,
            registry,
            reconciler: Arc::new(reconciler),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Local unit table.
    pub fn units(&self) -> &Arc<UnitManager> {
        self.reconciler.units()
    }

    /// Run both loops until shutdown. The machine lease is revoked on exit.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(machine = %self.config.machine_id, "Starting machine agent");
        let resync = Arc::new(Notify::new());

        let heartbeat = tokio::spawn(run_heartbeat_loop(
            self.registry.clone(),
            self.config.clone(),
            resync.clone(),
            shutdown.clone(),
        ));

        let reconciler = {
            let reconciler = self.reconciler.clone();
            tokio::spawn(async move { reconciler.run(resync, shutdown).await })
        };

        match heartbeat.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Heartbeat loop failed"),
            Err(e) => error!(error = %e, "Heartbeat task panicked"),
        }
        if let Err(e) = reconciler.await {
            error!(error = %e, "Reconciler task panicked");
        }
        info!(machine = %self.config.machine_id, "Machine agent stopped");
    }
}
