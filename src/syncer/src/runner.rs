//! One sync cycle: list, reconcile, then work through the worklist with
//! maintenance interleaved.

use std::sync::Arc;

use common::config::{Configuration, ProcessBy};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::catalog::PartitionCatalog;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::inventory::{ConnectionInventory, WarehouseInventory};
use crate::maintenance::MaintenanceScheduler;
use crate::metrics::SyncMetrics;
use crate::partition::ReconciliationDecision;
use crate::reconcile::ReconciliationEngine;
use crate::retry::RetryPolicy;
use crate::shutdown::Shutdown;
use crate::warehouse::Connector;
use crate::worker::{SyncOutcome, SyncWorker};

/// What happened during one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub planned: usize,
    pub succeeded: usize,
    /// Decisions that exhausted their attempts, with the last error
    pub failed: Vec<(ReconciliationDecision, String)>,
    pub interrupted: bool,
}

impl CycleReport {
    fn new(planned: usize) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            planned,
            succeeded: 0,
            failed: Vec::new(),
            interrupted: false,
        }
    }
}

pub struct SyncRunner {
    catalog: Arc<dyn PartitionCatalog>,
    inventory: Arc<dyn WarehouseInventory>,
    engine: ReconciliationEngine,
    worker: SyncWorker,
    maintenance: MaintenanceScheduler,
    connections: Arc<Mutex<ConnectionManager>>,
    metrics: SyncMetrics,
    shutdown: Shutdown,
}

impl SyncRunner {
    pub fn new(
        config: &Configuration,
        catalog: Arc<dyn PartitionCatalog>,
        connector: Arc<dyn Connector>,
        shutdown: Shutdown,
    ) -> Self {
        let metrics = SyncMetrics::new();
        let connections = Arc::new(Mutex::new(ConnectionManager::new(connector)));

        let worker = SyncWorker::new(
            connections.clone(),
            RetryPolicy::from(&config.sync),
            &config.bulk_load,
            metrics.clone(),
            shutdown.clone(),
        );
        let maintenance = MaintenanceScheduler::new(
            connections.clone(),
            config.sync.maintenance_interval as u64,
            metrics.clone(),
        );

        Self {
            catalog,
            inventory: Arc::new(ConnectionInventory::new(connections.clone())),
            engine: ReconciliationEngine::from(&config.sync),
            worker,
            maintenance,
            connections,
            metrics,
            shutdown,
        }
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// List, read the inventory and reconcile, without loading anything.
    /// Connections opened for the inventory are closed before returning.
    pub async fn plan(&self, process_by: ProcessBy) -> Result<Vec<ReconciliationDecision>> {
        let worklist = self.reconcile(process_by).await;
        self.connections.lock().await.kill_all().await;
        worklist
    }

    async fn reconcile(&self, process_by: ProcessBy) -> Result<Vec<ReconciliationDecision>> {
        let listing = self.catalog.list_partitions().await?;
        listing.log_skipped();

        let inventory = self.inventory.snapshot().await?;
        Ok(self
            .engine
            .reconcile(&listing.partitions, &inventory, process_by))
    }

    /// Run one full cycle. Per-decision failures are reported, not returned;
    /// only a failed listing or inventory query is an error.
    pub async fn run_cycle(&self, process_by: ProcessBy) -> Result<CycleReport> {
        let planned = self.reconcile(process_by).await;
        let worklist = match planned {
            Ok(worklist) => worklist,
            Err(e) => {
                self.connections.lock().await.kill_all().await;
                return Err(e);
            }
        };

        let mut report = CycleReport::new(worklist.len());
        log::info!(
            "Starting sync cycle {} with {} decisions",
            report.cycle_id,
            report.planned
        );

        for (index, decision) in worklist.iter().enumerate() {
            if self.shutdown.is_triggered() {
                log::warn!("Shutdown requested, stopping before {decision}");
                report.interrupted = true;
                break;
            }

            let counter = index as u64 + 1;
            self.maintenance.maybe_run(counter).await;

            match self.worker.sync_decision(decision).await {
                SyncOutcome::Loaded { .. } => report.succeeded += 1,
                SyncOutcome::Failed { error, .. } => {
                    report.failed.push((decision.clone(), error.to_string()));
                }
                SyncOutcome::Interrupted { .. } => {
                    report.interrupted = true;
                    break;
                }
            }
        }

        self.connections.lock().await.kill_all().await;

        log::info!(
            "Sync cycle {} finished: {}/{} succeeded, {} failed{}",
            report.cycle_id,
            report.succeeded,
            report.planned,
            report.failed.len(),
            if report.interrupted { ", interrupted" } else { "" }
        );
        for (decision, error) in &report.failed {
            log::warn!("Failed: {decision}: {error}");
        }
        self.metrics.summary().log();

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogListing, SkipReason, SkippedEntry};
    use crate::error::SyncError;
    use crate::partition::Partition;
    use crate::shutdown::ShutdownTrigger;
    use crate::testing::{InMemoryWarehouse, WarehouseRow};
    use crate::warehouse::StatementKind;
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};

    const ROLE_VAR: &str = "PARTSYNC_TEST_RUNNER_ROLE";

    struct StaticCatalog(Vec<Partition>);

    #[async_trait]
    impl PartitionCatalog for StaticCatalog {
        async fn list_partitions(&self) -> Result<CatalogListing> {
            Ok(CatalogListing {
                partitions: self.0.clone(),
                skipped: vec![SkippedEntry {
                    location: "temp/notes.txt".to_string(),
                    reason: SkipReason::Empty,
                }],
            })
        }
    }

    struct UnreachableCatalog;

    #[async_trait]
    impl PartitionCatalog for UnreachableCatalog {
        async fn list_partitions(&self) -> Result<CatalogListing> {
            Err(SyncError::Storage(object_store::Error::Generic {
                store: "test",
                source: "connection refused".into(),
            }))
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 6, 0, 0).unwrap()
    }

    fn config() -> Configuration {
        // SAFETY: every test in this module sets the same value
        unsafe { std::env::set_var(ROLE_VAR, "arn:aws:iam::123456789012:role/loader") };
        let mut config = Configuration::default();
        config.bulk_load.role_env_var = ROLE_VAR.to_string();
        config
    }

    /// `count` orgs under 2024-01-01, each with one source row loaded at `t0`.
    fn orgs(warehouse: &InMemoryWarehouse, count: usize) -> Vec<Partition> {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        (0..count)
            .map(|i| {
                let org = format!("org{i:03}");
                warehouse.add_source(
                    format!("s3://temp/date=2024-01-01/{org}"),
                    vec![WarehouseRow::new(date, i.to_string(), org.as_str(), t0(), "x")],
                );
                Partition {
                    date,
                    org_name: org,
                    size_bytes: 10,
                    last_modified: t0(),
                }
            })
            .collect()
    }

    fn runner(warehouse: &InMemoryWarehouse, partitions: Vec<Partition>, shutdown: Shutdown) -> SyncRunner {
        SyncRunner::new(
            &config(),
            Arc::new(StaticCatalog(partitions)),
            warehouse.connector(),
            shutdown,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_loads_every_decision_with_maintenance_cadence() {
        let warehouse = InMemoryWarehouse::new();
        let partitions = orgs(&warehouse, 61);
        let runner = runner(&warehouse, partitions, Shutdown::never());

        let report = runner.run_cycle(ProcessBy::DateOrg).await.unwrap();

        assert_eq!(report.planned, 61);
        assert_eq!(report.succeeded, 61);
        assert!(report.failed.is_empty());
        assert!(!report.interrupted);
        assert_eq!(warehouse.target_rows().len(), 61);
        assert_eq!(warehouse.count(StatementKind::Vacuum), 3);
        assert_eq!(warehouse.count(StatementKind::Analyze), 3);
        assert_eq!(runner.metrics().maintenance_runs(), 3);
        assert_eq!(warehouse.open_sessions(), 0);

        // Maintenance ran before decisions 1, 30 and 60
        let begins_before_each_vacuum: Vec<usize> = warehouse
            .journal()
            .iter()
            .scan(0, |begins, entry| {
                if entry.kind == StatementKind::Begin {
                    *begins += 1;
                }
                Some((entry.kind, *begins))
            })
            .filter(|(kind, _)| *kind == StatementKind::Vacuum)
            .map(|(_, begins)| begins)
            .collect();
        assert_eq!(begins_before_each_vacuum, vec![0, 29, 59]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_decision_does_not_halt_cycle() {
        let warehouse = InMemoryWarehouse::new();
        let mut partitions = orgs(&warehouse, 2);
        // no source files for this one
        partitions.insert(
            1,
            Partition {
                date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                org_name: "ghost".to_string(),
                size_bytes: 10,
                last_modified: t0(),
            },
        );
        let runner = runner(&warehouse, partitions, Shutdown::never());

        let report = runner.run_cycle(ProcessBy::DateOrg).await.unwrap();

        assert_eq!(report.planned, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.org_name.as_deref(), Some("ghost"));
        assert_eq!(warehouse.target_rows().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_cycle_is_empty() {
        let warehouse = InMemoryWarehouse::new();
        let partitions = orgs(&warehouse, 2);
        let runner = runner(&warehouse, partitions, Shutdown::never());

        runner.run_cycle(ProcessBy::DateOrg).await.unwrap();
        let report = runner.run_cycle(ProcessBy::DateOrg).await.unwrap();

        assert_eq!(report.planned, 0);
        assert_eq!(warehouse.target_rows().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_between_decisions() {
        let warehouse = InMemoryWarehouse::new();
        let partitions = orgs(&warehouse, 3);
        let (trigger, shutdown) = ShutdownTrigger::new();
        trigger.trigger();
        let runner = runner(&warehouse, partitions, shutdown);

        let report = runner.run_cycle(ProcessBy::DateOrg).await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.succeeded, 0);
        assert!(warehouse.target_rows().is_empty());
        assert_eq!(warehouse.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_plan_does_not_load() {
        let warehouse = InMemoryWarehouse::new();
        let partitions = orgs(&warehouse, 2);
        let runner = runner(&warehouse, partitions, Shutdown::never());

        let worklist = runner.plan(ProcessBy::Date).await.unwrap();

        assert_eq!(worklist.len(), 1);
        assert_eq!(worklist[0].org_name, None);
        assert_eq!(warehouse.count(StatementKind::Begin), 0);
    }

    #[tokio::test]
    async fn test_plan_closes_connections() {
        let warehouse = InMemoryWarehouse::new();
        let partitions = orgs(&warehouse, 2);
        let runner = runner(&warehouse, partitions, Shutdown::never());

        runner.plan(ProcessBy::DateOrg).await.unwrap();
        assert_eq!(warehouse.sessions_opened(), 1);
        assert_eq!(warehouse.open_sessions(), 0);

        warehouse.fail_statement(StatementKind::Inventory, 1);
        assert!(runner.plan(ProcessBy::DateOrg).await.is_err());
        assert_eq!(warehouse.sessions_opened(), 2);
        assert_eq!(warehouse.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_swap_commits_then_stops() {
        let warehouse = InMemoryWarehouse::new();
        let partitions = orgs(&warehouse, 3);
        let (trigger, shutdown) = ShutdownTrigger::new();
        warehouse.trigger_shutdown_on(StatementKind::InsertFromStaging, trigger);
        let runner = runner(&warehouse, partitions, shutdown);

        let report = runner.run_cycle(ProcessBy::DateOrg).await.unwrap();

        assert!(report.interrupted);
        assert_eq!(report.succeeded, 1);
        assert!(report.failed.is_empty());
        assert_eq!(warehouse.count(StatementKind::Commit), 1);
        assert_eq!(warehouse.count(StatementKind::Rollback), 0);
        // The next decision never starts a transaction
        assert_eq!(warehouse.count(StatementKind::Begin), 1);
        let loaded: Vec<_> = warehouse
            .target_rows()
            .into_iter()
            .map(|row| row.org_name)
            .collect();
        assert_eq!(loaded, vec!["org000"]);
        assert_eq!(warehouse.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_runs_on_spawned_task() {
        let warehouse = InMemoryWarehouse::new();
        let partitions = orgs(&warehouse, 2);
        let runner = Arc::new(runner(&warehouse, partitions, Shutdown::never()));

        let cycle = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run_cycle(ProcessBy::DateOrg).await }
        });
        let report = cycle.await.unwrap().unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(warehouse.count(StatementKind::Vacuum), 1);
        assert_eq!(warehouse.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_catalog_fails_cycle() {
        let warehouse = InMemoryWarehouse::new();
        let runner = SyncRunner::new(
            &config(),
            Arc::new(UnreachableCatalog),
            warehouse.connector(),
            Shutdown::never(),
        );

        assert!(matches!(
            runner.run_cycle(ProcessBy::DateOrg).await,
            Err(SyncError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_inventory_fails_cycle() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.fail_statement(StatementKind::Inventory, 1);
        let partitions = orgs(&warehouse, 1);
        let runner = runner(&warehouse, partitions, Shutdown::never());

        assert!(matches!(
            runner.run_cycle(ProcessBy::DateOrg).await,
            Err(SyncError::Warehouse(_))
        ));
        assert_eq!(warehouse.count(StatementKind::Begin), 0);
    }
}
