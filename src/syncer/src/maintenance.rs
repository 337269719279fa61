//! Periodic VACUUM/ANALYZE of the target table, interleaved with the worklist.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use crate::connection::ConnectionManager;
use crate::error::WarehouseError;
use crate::metrics::SyncMetrics;
use crate::warehouse::{Connector, Statement};

/// Default number of decisions between two maintenance runs.
pub const DEFAULT_MAINTENANCE_INTERVAL: u64 = 30;

/// Guards a single operation against re-entrant invocation.
#[derive(Debug)]
pub struct ExclusiveFlag {
    name: &'static str,
    running: AtomicBool,
}

impl ExclusiveFlag {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
        }
    }

    /// Claim the flag. `None` if the operation is already running.
    pub fn try_begin(&self) -> Option<FlagGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlagGuard { flag: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Held while the guarded operation runs. The flag is cleared when the guard
/// is ended or dropped, whatever the outcome.
#[derive(Debug)]
pub struct FlagGuard<'a> {
    flag: &'a ExclusiveFlag,
}

impl FlagGuard<'_> {
    pub fn end(self) {}
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.running.store(false, Ordering::Release);
    }
}

/// Result of one maintenance step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// The step was already in progress
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub vacuum: StepOutcome,
    pub analyze: StepOutcome,
    pub reconnected: bool,
}

impl MaintenanceReport {
    fn failures(&self) -> usize {
        [&self.vacuum, &self.analyze]
            .into_iter()
            .filter(|step| matches!(step, StepOutcome::Failed(_)))
            .count()
    }
}

pub struct MaintenanceScheduler {
    connections: Arc<Mutex<ConnectionManager>>,
    interval: u64,
    vacuum: ExclusiveFlag,
    analyze: ExclusiveFlag,
    metrics: SyncMetrics,
}

impl MaintenanceScheduler {
    pub fn new(connections: Arc<Mutex<ConnectionManager>>, interval: u64, metrics: SyncMetrics) -> Self {
        Self {
            connections,
            interval: interval.max(1),
            vacuum: ExclusiveFlag::new("vacuum"),
            analyze: ExclusiveFlag::new("analyze"),
            metrics,
        }
    }

    /// Maintenance fires on the first decision and on every multiple of the interval.
    pub fn should_fire(&self, counter: u64) -> bool {
        counter == 1 || counter % self.interval == 0
    }

    /// Run maintenance if `counter` is due.
    pub async fn maybe_run(&self, counter: u64) -> Option<MaintenanceReport> {
        if !self.should_fire(counter) {
            return None;
        }
        log::info!("Running warehouse maintenance at decision {counter}");
        Some(self.run().await)
    }

    /// Kill all connections, vacuum, analyze, then open a fresh connection.
    ///
    /// Holds the connection manager for the whole run, so no swap can be in
    /// flight. Failures are logged and reported, never propagated.
    pub async fn run(&self) -> MaintenanceReport {
        let mut connections = self.connections.lock().await;
        connections.kill_all().await;
        let connector = connections.connector();

        let vacuum = self
            .run_exclusive(&self.vacuum, Statement::Vacuum, connector.as_ref())
            .await;
        let analyze = self
            .run_exclusive(&self.analyze, Statement::Analyze, connector.as_ref())
            .await;

        let reconnected = match connections.create().await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to reconnect after maintenance: {e}");
                false
            }
        };

        let report = MaintenanceReport {
            vacuum,
            analyze,
            reconnected,
        };
        self.metrics.record_maintenance(report.failures());
        report
    }

    async fn run_exclusive(
        &self,
        flag: &ExclusiveFlag,
        statement: Statement,
        connector: &dyn Connector,
    ) -> StepOutcome {
        let Some(guard) = flag.try_begin() else {
            log::info!("{} already running, skipping", flag.name());
            return StepOutcome::Skipped;
        };

        let outcome = match Self::execute_dedicated(connector, &statement).await {
            Ok(()) => {
                log::info!("{} finished", flag.name());
                StepOutcome::Completed
            }
            Err(e) => {
                log::error!("{} failed: {e}", flag.name());
                StepOutcome::Failed(e.to_string())
            }
        };
        guard.end();
        outcome
    }

    /// Full-table statements run in autocommit mode on their own connection.
    async fn execute_dedicated(
        connector: &dyn Connector,
        statement: &Statement,
    ) -> Result<(), WarehouseError> {
        let mut session = connector.connect().await?;
        let result = session.execute(statement).await.map(|_| ());
        if let Err(e) = session.close().await {
            log::warn!("Failed to close maintenance connection: {e}");
        }
        result
    }
}
