//! Partitions present in object storage.

use std::fmt;

use async_trait::async_trait;
use common::storage::PartitionStore;
use futures::TryStreamExt;
use object_store::path::Path;

use crate::error::{PartitionParseError, Result};
use crate::partition::{Partition, PartitionKey};

/// Why a listed object did not become a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Malformed(PartitionParseError),
    /// Zero-byte object, nothing to load
    Empty,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Malformed(e) => write!(f, "malformed key: {e}"),
            SkipReason::Empty => write!(f, "empty object"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub location: String,
    pub reason: SkipReason,
}

/// Result of one listing: usable partitions in enumeration order plus
/// everything that was skipped and why.
#[derive(Debug, Clone, Default)]
pub struct CatalogListing {
    pub partitions: Vec<Partition>,
    pub skipped: Vec<SkippedEntry>,
}

impl CatalogListing {
    pub fn log_skipped(&self) {
        for entry in &self.skipped {
            log::warn!("Skipping '{}': {}", entry.location, entry.reason);
        }
    }
}

/// Source of the partition list.
#[async_trait]
pub trait PartitionCatalog: Send + Sync {
    /// List partitions. Only an unreachable store is an error; individual
    /// bad entries are reported in [`CatalogListing::skipped`].
    async fn list_partitions(&self) -> Result<CatalogListing>;
}

/// Catalog backed by an `object_store` listing.
pub struct ObjectStoreCatalog {
    store: PartitionStore,
}

impl ObjectStoreCatalog {
    pub fn new(store: PartitionStore) -> Self {
        Self { store }
    }

    fn classify(prefix: &Path, meta: object_store::ObjectMeta) -> std::result::Result<Partition, SkippedEntry> {
        let location = meta.location.to_string();
        let key = PartitionKey::parse(prefix, &meta.location).map_err(|e| SkippedEntry {
            location: location.clone(),
            reason: SkipReason::Malformed(e),
        })?;

        if meta.size == 0 {
            return Err(SkippedEntry {
                location,
                reason: SkipReason::Empty,
            });
        }

        Ok(Partition {
            date: key.date,
            org_name: key.org_name,
            size_bytes: meta.size,
            last_modified: meta.last_modified,
        })
    }
}

#[async_trait]
impl PartitionCatalog for ObjectStoreCatalog {
    async fn list_partitions(&self) -> Result<CatalogListing> {
        let prefix = &self.store.prefix;
        log::info!("Listing partitions under '{prefix}'");

        let objects: Vec<_> = self.store.store.list(Some(prefix)).try_collect().await?;

        let mut listing = CatalogListing::default();
        for meta in objects {
            match Self::classify(prefix, meta) {
                Ok(partition) => listing.partitions.push(partition),
                Err(skipped) => listing.skipped.push(skipped),
            }
        }

        log::info!(
            "Found {} partitions ({} skipped)",
            listing.partitions.len(),
            listing.skipped.len()
        );
        Ok(listing)
    }
}
