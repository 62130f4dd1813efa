//! Unit runtime interface and mock implementation.
//!
//! The runtime interface abstracts the local execution supervisor:
//! - Starting and stopping unit processes
//! - Process status polling
//!
//! A mock implementation is provided for testing and development.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use fleet_id::UnitName;
use fleet_registry::{ProcessStatus, Unit};
use tracing::{debug, info};

/// Local execution supervisor.
#[async_trait]
pub trait UnitRuntime: Send + Sync {
    /// Start the unit's process.
    async fn start(&self, unit: &Unit) -> Result<()>;

    /// Stop the unit's process. Stopping a unit that is not running succeeds.
    async fn stop(&self, name: &UnitName) -> Result<()>;

    /// Current process status. Unknown units are `Stopped`.
    async fn status(&self, name: &UnitName) -> Result<ProcessStatus>;
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    processes: Mutex<HashMap<UnitName, ProcessStatus>>,

    /// Units whose starts fail.
    failing_units: Mutex<HashSet<UnitName>>,

    /// Whether every start should "fail".
    fail_starts: bool,

    starts: AtomicU64,
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            failing_units: Mutex::new(HashSet::new()),
            fail_starts: false,
            starts: AtomicU64::new(0),
        }
    }

    /// Create a mock runtime that fails all starts.
    pub fn failing() -> Self {
        Self {
            fail_starts: true,
            ..Self::new()
        }
    }

    /// Make every future start of `name` fail.
    pub fn fail_unit(&self, name: &UnitName) {
        lock(&self.failing_units).insert(name.clone());
    }

    /// Let `name` start again.
    pub fn heal_unit(&self, name: &UnitName) {
        lock(&self.failing_units).remove(name);
    }

    /// Simulate the process of `name` dying.
    pub fn crash(&self, name: &UnitName) {
        if let Some(status) = lock(&self.processes).get_mut(name) {
            *status = ProcessStatus::Failed;
        }
    }

    /// Units currently running, sorted.
    pub fn running(&self) -> Vec<UnitName> {
        let mut running: Vec<_> = lock(&self.processes)
            .iter()
            .filter(|(_, status)| **status == ProcessStatus::Running)
            .map(|(name, _)| name.clone())
            .collect();
        running.sort();
        running
    }

    pub fn is_running(&self, name: &UnitName) -> bool {
        lock(&self.processes).get(name) == Some(&ProcessStatus::Running)
    }

    /// Total start attempts.
    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl UnitRuntime for MockRuntime {
    async fn start(&self, unit: &Unit) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_starts || lock(&self.failing_units).contains(&unit.name) {
            lock(&self.processes).insert(unit.name.clone(), ProcessStatus::Failed);
            anyhow::bail!("Mock runtime configured to fail");
        }

        info!(
            unit = %unit.name,
            definition_bytes = unit.definition.len(),
            "[MOCK] Starting unit"
        );
        lock(&self.processes).insert(unit.name.clone(), ProcessStatus::Running);
        Ok(())
    }

    async fn stop(&self, name: &UnitName) -> Result<()> {
        if lock(&self.processes).remove(name).is_some() {
            info!(unit = %name, "[MOCK] Stopping unit");
        }
        Ok(())
    }

    async fn status(&self, name: &UnitName) -> Result<ProcessStatus> {
        let status = lock(&self.processes)
            .get(name)
            .copied()
            .unwrap_or(ProcessStatus::Stopped);
        debug!(unit = %name, %status, "[MOCK] Checking unit status");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(name: &str) -> Unit {
        Unit::new(UnitName::parse(name).unwrap(), "ExecStart=/bin/true")
    }

    #[tokio::test]
    async fn test_mock_runtime_start_stop() {
        let runtime = MockRuntime::new();
        let web = unit("web.service");

        runtime.start(&web).await.unwrap();
        assert_eq!(runtime.status(&web.name).await.unwrap(), ProcessStatus::Running);
        assert_eq!(runtime.running(), vec![web.name.clone()]);

        runtime.stop(&web.name).await.unwrap();
        assert_eq!(runtime.status(&web.name).await.unwrap(), ProcessStatus::Stopped);
        runtime.stop(&web.name).await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_runtime_failing() {
        let runtime = MockRuntime::failing();
        let web = unit("web.service");

        assert!(runtime.start(&web).await.is_err());
        assert_eq!(runtime.status(&web.name).await.unwrap(), ProcessStatus::Failed);
    }

    #[tokio::test]
    async fn test_mock_runtime_failure_injection() {
        let runtime = MockRuntime::new();
        let web = unit("web.service");
        let db = unit("db.service");

        runtime.fail_unit(&web.name);
        assert!(runtime.start(&web).await.is_err());
        runtime.start(&db).await.unwrap();

        runtime.crash(&db.name);
        assert_eq!(runtime.status(&db.name).await.unwrap(), ProcessStatus::Failed);

        runtime.heal_unit(&web.name);
        runtime.start(&web).await.unwrap();
        assert_eq!(runtime.start_count(), 3);
    }
}
