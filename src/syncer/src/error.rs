use std::time::Duration;

use thiserror::Error;

use crate::warehouse::StatementKind;

/// Failure reported by a warehouse session.
#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("warehouse driver error: {0}")]
    Driver(#[from] sqlx::Error),

    #[error("{statement} rejected: {message}")]
    Rejected {
        statement: StatementKind,
        message: String,
    },

    #[error("could not connect to warehouse: {0}")]
    Connect(String),

    #[error("connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("session is closed")]
    Closed,

    #[error("load role variable '{0}' is not set")]
    MissingRole(String),
}

impl WarehouseError {
    pub fn rejected(statement: StatementKind, message: impl Into<String>) -> Self {
        WarehouseError::Rejected {
            statement,
            message: message.into(),
        }
    }
}

/// Engine-level error taxonomy.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("object storage error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("no current warehouse connection")]
    NoConnection,

}

impl SyncError {
    /// Whether a swap failing with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::Warehouse(WarehouseError::MissingRole(_)))
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Warehouse(WarehouseError::Driver(e))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Why an object key could not be read as a partition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionParseError {
    #[error("key is outside the listing prefix")]
    OutsidePrefix,

    #[error("missing 'date=' path segment")]
    MissingDateSegment,

    #[error("invalid partition date '{0}'")]
    InvalidDate(String),

    #[error("missing organization name after the date segment")]
    MissingOrgName,
}

/// Outcome of a bounded retry that did not produce a value.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32, last_error: Option<E> },
}
