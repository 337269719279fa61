//! Shared plumbing for the partsync binaries: layered configuration,
//! object-store construction and CLI/logging helpers.

pub mod cli;
pub mod config;
pub mod storage;

pub use config::{Configuration, ProcessBy};
pub use storage::{PartitionStore, create_partition_store};
