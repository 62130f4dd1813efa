//! Scheduler background worker.
//!
//! Competes for the leader lease and, while leader, runs the reconciler on
//! every relevant registry event and on a periodic sweep.

use std::future::pending;
use std::sync::Arc;

use fleet_registry::{
    PayloadVerifier, RegistryEvent, RegistryResult, RegistryWatch, SchedulerRegistry,
};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use super::reconciler::SchedulerReconciler;
use crate::config::EngineConfig;
use crate::leader::{EngineState, Leadership};

/// Scheduler worker that runs the reconciliation loop.
pub struct SchedulerWorker {
    registry: Arc<dyn SchedulerRegistry>,
    reconciler: SchedulerReconciler,
    config: EngineConfig,
    state: watch::Sender<EngineState>,
}

/// Loop-local state of a leader.
struct Tenure {
    watch: Option<RegistryWatch>,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Tenure {
    fn new() -> Self {
        Self {
            watch: None,
            failures: 0,
            retry_at: None,
        }
    }
}

impl SchedulerWorker {
    /// Create a new scheduler worker.
    pub fn new(registry: Arc<dyn SchedulerRegistry>, config: EngineConfig) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        Self {
            reconciler: SchedulerReconciler::new(registry.clone(), config.version),
            registry,
            config,
            state,
        }
    }

    /// Only schedule units whose signature verifies.
    pub fn with_verifier(mut self, verifier: Arc<dyn PayloadVerifier>) -> Self {
        self.reconciler = self.reconciler.with_verifier(verifier);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: EngineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Engine state changed");
        }
    }

    /// Run the scheduler worker until shutdown is signaled.
    #[instrument(skip(self, shutdown), fields(engine = %self.config.engine_id))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            version = %self.config.version,
            lease_ttl_secs = self.config.lease_ttl.as_secs(),
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "Starting scheduling engine"
        );

        let mut leadership = Leadership::new(
            self.registry.clone(),
            self.config.engine_id,
            self.config.lease_ttl,
        );
        let mut tenure = Tenure::new();

        let mut renew = tokio::time::interval(self.config.renew_interval);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Don't immediately sweep on startup - election runs a pass
        sweep.tick().await;

        loop {
            tokio::select! {
                _ = renew.tick() => {
                    if leadership.is_leader() {
                        if !leadership.renew().await {
                            self.step_down(&mut leadership, &mut tenure);
                        }
                    } else {
                        if leadership.has_lapsed() {
                            self.step_down(&mut leadership, &mut tenure);
                        }
                        self.try_elect(&mut leadership, &mut tenure).await;
                    }
                }
                _ = sweep.tick(), if leadership.is_leader() => {
                    debug!("Periodic sweep");
                    self.run_pass(&mut leadership, &mut tenure).await;
                }
                event = next_event(&mut tenure.watch), if tenure.watch.is_some() => {
                    match event {
                        Ok(Some(event)) if triggers_pass(&event) => {
                            debug!(?event, "Registry change");
                            self.run_pass(&mut leadership, &mut tenure).await;
                        }
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            warn!("Registry watch closed");
                            tenure.watch = None;
                        }
                        Err(e) => {
                            warn!(error = %e, "Registry watch failed, reopening");
                            tenure.watch = None;
                            self.open_watch(&mut tenure).await;
                        }
                    }
                }
                _ = sleep_until(tenure.retry_at), if tenure.retry_at.is_some() => {
                    tenure.retry_at = None;
                    self.run_pass(&mut leadership, &mut tenure).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduling engine shutting down");
                        break;
                    }
                }
            }
        }

        leadership.release().await;
        self.set_state(EngineState::Idle);
    }

    async fn try_elect(&self, leadership: &mut Leadership, tenure: &mut Tenure) {
        match leadership.try_acquire().await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(error = %e, "Leader election failed");
                return;
            }
        }

        info!("Elected scheduling engine leader");
        match self.registry.set_latest_version(self.config.version).await {
            Ok(true) => info!(version = %self.config.version, "Advanced cluster version"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to advance cluster version"),
        }

        *tenure = Tenure::new();
        self.set_state(EngineState::Watching);
        self.open_watch(tenure).await;
        self.run_pass(leadership, tenure).await;
    }

    async fn open_watch(&self, tenure: &mut Tenure) {
        match self.registry.watch().await {
            Ok(watch) => tenure.watch = Some(watch),
            Err(e) => {
                warn!(error = %e, "Failed to open registry watch");
                self.schedule_retry(tenure);
            }
        }
    }

    fn step_down(&self, leadership: &mut Leadership, tenure: &mut Tenure) {
        warn!("Lost scheduling engine leadership");
        leadership.abandon();
        *tenure = Tenure::new();
        self.set_state(EngineState::Idle);
    }

    fn schedule_retry(&self, tenure: &mut Tenure) {
        let delay = self.config.retry_backoff.delay(tenure.failures);
        tenure.failures = tenure.failures.saturating_add(1);
        tenure.retry_at = Some(Instant::now() + delay);
        debug!(delay_ms = delay.as_millis() as u64, failures = tenure.failures, "Retry scheduled");
    }

    /// Run a single reconciliation pass.
    async fn run_pass(&self, leadership: &mut Leadership, tenure: &mut Tenure) {
        let Some(guard) = leadership.guard() else {
            return;
        };

        self.set_state(EngineState::Scheduling);
        let result = self.reconciler.reconcile(&guard).await;

        match result {
            Ok(stats) => {
                tenure.failures = 0;
                tenure.retry_at = None;
                if tenure.watch.is_none() {
                    self.open_watch(tenure).await;
                }
                self.set_state(EngineState::Watching);
                if stats.changed() {
                    debug!(?stats, "Pass applied changes");
                }
            }
            Err(e) if e.is_leadership_lost() => {
                self.step_down(leadership, tenure);
            }
            Err(e) => {
                error!(error = %e, "Scheduler reconciliation failed");
                self.set_state(EngineState::Watching);
                self.schedule_retry(tenure);
            }
        }
    }
}

/// Returns true for changes that can alter placement decisions.
fn triggers_pass(event: &RegistryEvent) -> bool {
    !matches!(
        event,
        RegistryEvent::RuntimeChanged { .. } | RegistryEvent::LeaderChanged(_)
    )
}

async fn next_event(watch: &mut Option<RegistryWatch>) -> RegistryResult<Option<RegistryEvent>> {
    match watch {
        Some(watch) => watch.next().await,
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}
