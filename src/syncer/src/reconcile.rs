//! Diffs the partition catalog against the warehouse inventory to produce the
//! worklist of partitions that need (re)loading.

use std::collections::HashSet;
use std::time::Duration;

use common::config::{ProcessBy, SyncConfig};

use crate::inventory::InventorySnapshot;
use crate::partition::{DecisionReason, Partition, ReconciliationDecision};

/// Default age after which an unchanged partition is reloaded anyway.
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(5 * 24 * 3600);

#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    staleness_threshold: chrono::Duration,
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new(DEFAULT_STALENESS_THRESHOLD)
    }
}

impl From<&SyncConfig> for ReconciliationEngine {
    fn from(config: &SyncConfig) -> Self {
        Self::new(config.staleness_threshold)
    }
}

impl ReconciliationEngine {
    pub fn new(staleness_threshold: Duration) -> Self {
        Self {
            staleness_threshold: chrono::Duration::from_std(staleness_threshold)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Build the worklist. Output order follows catalog enumeration order;
    /// duplicates are dropped.
    pub fn reconcile(
        &self,
        partitions: &[Partition],
        inventory: &InventorySnapshot,
        process_by: ProcessBy,
    ) -> Vec<ReconciliationDecision> {
        let mut seen = HashSet::new();

        let worklist: Vec<_> = match process_by {
            // Dates come from the catalog's non-empty partitions, not from the
            // warehouse inventory, so a date only present in the warehouse is
            // never reloaded from an empty prefix
            ProcessBy::Date => partitions
                .iter()
                .map(|p| ReconciliationDecision::for_date(p.date))
                .filter(|d| seen.insert(d.clone()))
                .collect(),
            ProcessBy::DateOrg => partitions
                .iter()
                .filter_map(|p| {
                    self.evaluate(p, inventory).map(|reason| {
                        ReconciliationDecision::for_org(p.date, p.org_name.clone(), reason)
                    })
                })
                .filter(|d| seen.insert(d.clone()))
                .collect(),
        };

        log::info!(
            "Reconciliation ({process_by}) produced {} decisions from {} partitions",
            worklist.len(),
            partitions.len()
        );
        for decision in &worklist {
            log::debug!("Update needed for {decision} ({})", decision.reason);
        }

        worklist
    }

    /// Decide whether one `(date, org)` partition needs loading.
    fn evaluate(
        &self,
        partition: &Partition,
        inventory: &InventorySnapshot,
    ) -> Option<DecisionReason> {
        let Some(history) = inventory.org_history(&partition.org_name) else {
            return Some(DecisionReason::NeverLoaded);
        };

        if !inventory.contains(partition.date, &partition.org_name) {
            return Some(DecisionReason::MissingForDate);
        }

        if history.date != partition.date {
            return Some(DecisionReason::CanonicalDateMoved);
        }

        let age = partition.last_modified - history.previous_upload_to_s3;
        if age > self.staleness_threshold {
            return Some(DecisionReason::Stale);
        }

        None
    }
}
