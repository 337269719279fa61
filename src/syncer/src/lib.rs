//! Incremental sync of date/org partitioned files from object storage into a
//! warehouse table.
//!
//! A cycle lists the partitions in storage ([`catalog`]), reads what the
//! warehouse holds ([`inventory`]), decides what needs loading
//! ([`reconcile`]) and swaps each partition's rows in through a staging table
//! ([`worker`]), with periodic maintenance ([`maintenance`]) in between.

pub mod catalog;
pub mod connection;
pub mod error;
pub mod inventory;
pub mod maintenance;
pub mod metrics;
pub mod partition;
pub mod postgres;
pub mod reconcile;
pub mod retry;
pub mod runner;
pub mod shutdown;
pub mod warehouse;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use catalog::{ObjectStoreCatalog, PartitionCatalog};
pub use error::{Result, SyncError, WarehouseError};
pub use partition::{DecisionReason, Partition, ReconciliationDecision};
pub use postgres::PgConnector;
pub use reconcile::ReconciliationEngine;
pub use runner::{CycleReport, SyncRunner};
pub use shutdown::{Shutdown, ShutdownTrigger, escalate_signals};
