//! Staging-table swap for one worklist decision.
//!
//! Inside a single transaction: drop any leftover staging table, create an
//! empty one shaped like the target, bulk-load the partition files into it,
//! delete the target rows whose `(start_date, org_id, org_name)` appear in
//! staging, insert the staged rows, commit. Any failure rolls the transaction
//! back, recycles the connection and hands the error to the retry wrapper.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use common::config::BulkLoadConfig;
use tokio::sync::Mutex;

use crate::connection::ConnectionManager;
use crate::error::{RetryError, Result, SyncError};
use crate::metrics::SyncMetrics;
use crate::partition::ReconciliationDecision;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::shutdown::Shutdown;
use crate::warehouse::{Statement, WarehouseSession};

/// Row counts of one committed swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwapStats {
    pub rows_loaded: u64,
    pub rows_deleted: u64,
    pub rows_inserted: u64,
}

/// Final outcome of a decision after retries.
#[derive(Debug)]
pub enum SyncOutcome {
    Loaded {
        stats: SwapStats,
        attempts: u32,
        duration: Duration,
    },
    Failed {
        attempts: u32,
        error: SyncError,
    },
    /// Shutdown was requested before the decision could complete
    Interrupted { attempts: u32 },
}

impl SyncOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, SyncOutcome::Loaded { .. })
    }
}

pub struct SyncWorker {
    connections: Arc<Mutex<ConnectionManager>>,
    retry: RetryPolicy,
    source_root: String,
    metrics: SyncMetrics,
    shutdown: Shutdown,
}

impl SyncWorker {
    pub fn new(
        connections: Arc<Mutex<ConnectionManager>>,
        retry: RetryPolicy,
        load: &BulkLoadConfig,
        metrics: SyncMetrics,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            connections,
            retry,
            source_root: load.source_root.clone(),
            metrics,
            shutdown,
        }
    }

    /// Swap one decision's rows with bounded retry. Never returns an error:
    /// a failed decision is reported in the outcome so the cycle can move on.
    pub async fn sync_decision(&self, decision: &ReconciliationDecision) -> SyncOutcome {
        log::info!("Copying data from object storage to warehouse for: {decision}");
        self.metrics.record_decision_start();
        let started = Instant::now();
        let attempts_made = AtomicU32::new(0);

        let operation_name = format!("swap {decision}");
        let result = retry_with_backoff(
            &self.retry,
            &operation_name,
            &self.shutdown,
            SyncError::is_retryable,
            |attempt| {
                attempts_made.store(attempt, Ordering::Relaxed);
                self.metrics.record_attempt(attempt);
                self.swap_once(decision)
            },
        )
        .await;

        match result {
            Ok(stats) => {
                let duration = started.elapsed();
                self.metrics.record_decision_success(
                    stats.rows_loaded,
                    stats.rows_deleted,
                    stats.rows_inserted,
                    duration,
                );
                log::info!(
                    "Finished: {decision} (loaded {}, replaced {}, inserted {} rows), moving on to next decision",
                    stats.rows_loaded,
                    stats.rows_deleted,
                    stats.rows_inserted
                );
                SyncOutcome::Loaded {
                    stats,
                    attempts: attempts_made.load(Ordering::Relaxed),
                    duration,
                }
            }
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                self.metrics.record_decision_failure();
                log::error!("Giving up on {decision} after {attempts} attempts: {last_error}");
                SyncOutcome::Failed {
                    attempts,
                    error: last_error,
                }
            }
            Err(RetryError::Cancelled { attempts, .. }) => {
                log::warn!("Shutdown requested, abandoning {decision} after {attempts} attempts");
                SyncOutcome::Interrupted { attempts }
            }
        }
    }

    /// One transactional attempt. Holds the connection lock for its whole duration.
    async fn swap_once(&self, decision: &ReconciliationDecision) -> Result<SwapStats> {
        let mut connections = self.connections.lock().await;
        let session = connections.current_or_create().await?;

        match self.run_swap(session, decision).await {
            Ok(stats) => Ok(stats),
            Err(e) => {
                log::error!("Swap failed for {decision}, rolling back: {e}");
                if let Err(rollback_error) = session.rollback().await {
                    log::error!("Rollback failed for {decision}: {rollback_error}");
                }
                if let Err(reconnect_error) = connections.recycle().await {
                    // left for the next attempt to surface
                    log::warn!("Failed to recreate warehouse connection: {reconnect_error}");
                }
                Err(e)
            }
        }
    }

    async fn run_swap(
        &self,
        session: &mut (dyn WarehouseSession + 'static),
        decision: &ReconciliationDecision,
    ) -> Result<SwapStats> {
        session.begin().await?;
        session.execute(&Statement::DropStaging).await?;
        session.execute(&Statement::CreateStaging).await?;

        let source_uri = decision.source_uri(&self.source_root);
        log::debug!("Loading {source_uri} into staging");
        let rows_loaded = session
            .execute(&Statement::CopyIntoStaging { source_uri })
            .await?;

        let rows_deleted = session.execute(&Statement::DeleteMatchingStaging).await?;
        let rows_inserted = session.execute(&Statement::InsertFromStaging).await?;
        session.commit().await?;

        Ok(SwapStats {
            rows_loaded,
            rows_deleted,
            rows_inserted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::DecisionReason;
    use crate::shutdown::ShutdownTrigger;
    use crate::testing::{InMemoryWarehouse, WarehouseRow};
    use crate::warehouse::StatementKind;
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};

    const ROLE_VAR: &str = "PARTSYNC_TEST_WORKER_ROLE";

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn acme(payload: &str, inserted: DateTime<Utc>) -> WarehouseRow {
        WarehouseRow::new(date("2024-01-01"), "1", "acme", inserted, payload)
    }

    fn worker(warehouse: &InMemoryWarehouse, shutdown: Shutdown) -> (SyncWorker, SyncMetrics) {
        // SAFETY: every test in this module sets the same value
        unsafe { std::env::set_var(ROLE_VAR, "arn:aws:iam::123456789012:role/loader") };
        let load = BulkLoadConfig {
            role_env_var: ROLE_VAR.to_string(),
            ..Default::default()
        };
        let metrics = SyncMetrics::new();
        let connections = Arc::new(Mutex::new(ConnectionManager::new(warehouse.connector())));
        let worker = SyncWorker::new(
            connections,
            RetryPolicy::default(),
            &load,
            metrics.clone(),
            shutdown,
        );
        (worker, metrics)
    }

    fn acme_decision() -> ReconciliationDecision {
        ReconciliationDecision::for_org(date("2024-01-01"), "acme", DecisionReason::NeverLoaded)
    }

    #[tokio::test(start_paused = true)]
    async fn test_loads_new_partition() {
        let warehouse = InMemoryWarehouse::new();
        let rows = vec![acme("a", at(2)), acme("b", at(2)), acme("c", at(2))];
        warehouse.add_source("s3://temp/date=2024-01-01/acme", rows.clone());
        let (worker, metrics) = worker(&warehouse, Shutdown::never());

        let outcome = worker.sync_decision(&acme_decision()).await;

        match outcome {
            SyncOutcome::Loaded {
                stats, attempts, ..
            } => {
                assert_eq!(
                    stats,
                    SwapStats {
                        rows_loaded: 3,
                        rows_deleted: 0,
                        rows_inserted: 3
                    }
                );
                assert_eq!(attempts, 1);
            }
            other => panic!("expected a load, got {other:?}"),
        }
        assert_eq!(warehouse.target_rows(), rows);
        assert_eq!(metrics.decisions_succeeded(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaces_existing_rows_for_key() {
        let warehouse = InMemoryWarehouse::new();
        let other_org = WarehouseRow::new(date("2024-01-01"), "2", "globex", at(1), "keep");
        warehouse.seed_target(vec![acme("old", at(1)), other_org.clone()]);
        warehouse.add_source("s3://temp/date=2024-01-01/acme", vec![acme("new", at(3))]);
        let (worker, _) = worker(&warehouse, Shutdown::never());

        let outcome = worker.sync_decision(&acme_decision()).await;
        assert!(outcome.is_loaded());

        let mut target = warehouse.target_rows();
        target.sort_by(|a, b| a.org_name.cmp(&b.org_name));
        assert_eq!(target, vec![acme("new", at(3)), other_org]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_swap_leaves_target_untouched() {
        for failing in [
            StatementKind::CopyIntoStaging,
            StatementKind::DeleteMatchingStaging,
            StatementKind::InsertFromStaging,
            StatementKind::Commit,
        ] {
            let warehouse = InMemoryWarehouse::new();
            let seeded = vec![acme("old", at(1))];
            warehouse.seed_target(seeded.clone());
            warehouse.add_source("s3://temp/date=2024-01-01/acme", vec![acme("new", at(3))]);
            warehouse.fail_statement(failing, u32::MAX);
            let (worker, metrics) = worker(&warehouse, Shutdown::never());

            let outcome = worker.sync_decision(&acme_decision()).await;

            assert!(
                matches!(outcome, SyncOutcome::Failed { attempts: 2, .. }),
                "{failing}: {outcome:?}"
            );
            assert_eq!(warehouse.target_rows(), seeded, "{failing}");
            assert_eq!(metrics.decisions_failed(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_bounded_and_backs_off() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.fail_statement(StatementKind::CopyIntoStaging, u32::MAX);
        let (worker, _) = worker(&warehouse, Shutdown::never());

        let outcome = worker.sync_decision(&acme_decision()).await;
        assert!(matches!(outcome, SyncOutcome::Failed { attempts: 2, .. }));

        let journal = warehouse.journal();
        let copies: Vec<_> = journal
            .iter()
            .filter(|e| e.kind == StatementKind::CopyIntoStaging)
            .collect();
        assert_eq!(copies.len(), 2);

        let gap = copies[1].at - copies[0].at;
        assert!(gap >= std::time::Duration::from_secs(1), "{gap:?}");
        assert!(gap <= std::time::Duration::from_secs(60), "{gap:?}");

        // each failed attempt is followed by a fresh connection
        assert_ne!(copies[0].session_id, copies[1].session_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers_on_retry() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.add_source("s3://temp/date=2024-01-01/acme", vec![acme("a", at(2))]);
        warehouse.fail_statement(StatementKind::DeleteMatchingStaging, 1);
        let (worker, metrics) = worker(&warehouse, Shutdown::never());

        let outcome = worker.sync_decision(&acme_decision()).await;

        assert!(matches!(outcome, SyncOutcome::Loaded { attempts: 2, .. }));
        assert_eq!(warehouse.target_rows(), vec![acme("a", at(2))]);
        assert_eq!(metrics.summary().retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_date_decision_loads_every_org() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.add_source("s3://temp/date=2024-01-01/acme", vec![acme("a", at(2))]);
        warehouse.add_source(
            "s3://temp/date=2024-01-01/globex",
            vec![WarehouseRow::new(date("2024-01-01"), "2", "globex", at(2), "g")],
        );
        let (worker, _) = worker(&warehouse, Shutdown::never());

        let outcome = worker
            .sync_decision(&ReconciliationDecision::for_date(date("2024-01-01")))
            .await;

        assert!(outcome.is_loaded());
        assert_eq!(warehouse.target_rows().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_decision_interrupts() {
        let warehouse = InMemoryWarehouse::new();
        let (trigger, shutdown) = ShutdownTrigger::new();
        trigger.trigger();
        let (worker, _) = worker(&warehouse, shutdown);

        let outcome = worker.sync_decision(&acme_decision()).await;

        assert!(matches!(outcome, SyncOutcome::Interrupted { attempts: 0 }));
        assert_eq!(warehouse.count(StatementKind::Begin), 0);
    }
}
