//! What the warehouse currently holds, indexed for reconciliation.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;

use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::warehouse::InventoryRecord;

/// Most recent load of an organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgHistory {
    /// The organization's most recent `start_date` in the warehouse
    pub date: NaiveDate,
    /// Load timestamp of the rows under `date`
    pub previous_upload_to_s3: DateTime<Utc>,
}

/// Index over the `(date, org_name, last_inserted_at)` tuples present in the warehouse.
#[derive(Debug, Clone, Default)]
pub struct InventorySnapshot {
    orgs_by_date: HashMap<NaiveDate, HashSet<String>>,
    history_by_org: HashMap<String, OrgHistory>,
}

impl InventorySnapshot {
    pub fn from_records(records: impl IntoIterator<Item = InventoryRecord>) -> Self {
        let mut snapshot = Self::default();

        for record in records {
            snapshot
                .orgs_by_date
                .entry(record.start_date)
                .or_default()
                .insert(record.org_name.clone());

            let candidate = OrgHistory {
                date: record.start_date,
                previous_upload_to_s3: record.last_inserted_at,
            };
            match snapshot.history_by_org.entry(record.org_name) {
                Entry::Occupied(mut current) => {
                    let known = current.get();
                    if (candidate.date, candidate.previous_upload_to_s3)
                        > (known.date, known.previous_upload_to_s3)
                    {
                        current.insert(candidate);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(candidate);
                }
            }
        }

        snapshot
    }

    /// Whether any rows exist for `org_name` under `date`.
    pub fn contains(&self, date: NaiveDate, org_name: &str) -> bool {
        self.orgs_by_date
            .get(&date)
            .is_some_and(|orgs| orgs.contains(org_name))
    }

    /// `None` means the organization has never been loaded.
    pub fn org_history(&self, org_name: &str) -> Option<&OrgHistory> {
        self.history_by_org.get(org_name)
    }
}

/// Source of the warehouse inventory.
#[async_trait]
pub trait WarehouseInventory: Send + Sync {
    async fn snapshot(&self) -> Result<InventorySnapshot>;
}

/// Inventory read through the managed warehouse connection.
pub struct ConnectionInventory {
    connections: Arc<Mutex<ConnectionManager>>,
}

impl ConnectionInventory {
    pub fn new(connections: Arc<Mutex<ConnectionManager>>) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl WarehouseInventory for ConnectionInventory {
    async fn snapshot(&self) -> Result<InventorySnapshot> {
        let mut connections = self.connections.lock().await;
        let records = connections.current_or_create().await?.fetch_inventory().await?;

        log::info!(
            "Warehouse inventory holds {} (date, org) groups",
            records.len()
        );
        Ok(InventorySnapshot::from_records(records))
    }
}
