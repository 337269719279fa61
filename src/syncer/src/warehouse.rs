//! Warehouse SQL surface and the session seam the engine talks through.
//!
//! The engine never builds SQL strings directly: it issues typed
//! [`Statement`]s on a [`WarehouseSession`], and sessions that speak SQL
//! render them with a [`SqlRenderer`].

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use common::config::{BulkLoadConfig, WarehouseConfig};

use crate::error::WarehouseError;

/// Statements issued by the swap protocol and by maintenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    DropStaging,
    CreateStaging,
    CopyIntoStaging { source_uri: String },
    DeleteMatchingStaging,
    InsertFromStaging,
    Vacuum,
    Analyze,
}

impl Statement {
    pub fn kind(&self) -> StatementKind {
        match self {
            Statement::DropStaging => StatementKind::DropStaging,
            Statement::CreateStaging => StatementKind::CreateStaging,
            Statement::CopyIntoStaging { .. } => StatementKind::CopyIntoStaging,
            Statement::DeleteMatchingStaging => StatementKind::DeleteMatchingStaging,
            Statement::InsertFromStaging => StatementKind::InsertFromStaging,
            Statement::Vacuum => StatementKind::Vacuum,
            Statement::Analyze => StatementKind::Analyze,
        }
    }
}

/// Statement discriminant, also covering transaction control and the inventory query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Begin,
    Commit,
    Rollback,
    DropStaging,
    CreateStaging,
    CopyIntoStaging,
    DeleteMatchingStaging,
    InsertFromStaging,
    Vacuum,
    Analyze,
    Inventory,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatementKind::Begin => "BEGIN",
            StatementKind::Commit => "COMMIT",
            StatementKind::Rollback => "ROLLBACK",
            StatementKind::DropStaging => "DROP staging",
            StatementKind::CreateStaging => "CREATE staging",
            StatementKind::CopyIntoStaging => "COPY into staging",
            StatementKind::DeleteMatchingStaging => "DELETE USING staging",
            StatementKind::InsertFromStaging => "INSERT from staging",
            StatementKind::Vacuum => "VACUUM",
            StatementKind::Analyze => "ANALYZE",
            StatementKind::Inventory => "inventory query",
        };
        f.write_str(name)
    }
}

/// One `(start_date, org_name)` group present in the target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryRecord {
    pub start_date: NaiveDate,
    pub org_name: String,
    pub last_inserted_at: DateTime<Utc>,
}

/// Columns identifying the rows owned by one partition.
pub const KEY_COLUMNS: [&str; 3] = ["start_date", "org_id", "org_name"];

/// Renders [`Statement`]s as warehouse (Redshift dialect) SQL.
#[derive(Debug, Clone)]
pub struct SqlRenderer {
    target_table: String,
    staging_table: String,
    load: BulkLoadConfig,
}

impl SqlRenderer {
    /// Table names are expected to be validated identifiers.
    pub fn new(warehouse: &WarehouseConfig, load: &BulkLoadConfig) -> Self {
        Self {
            target_table: warehouse.target_table.clone(),
            staging_table: warehouse.staging_table.clone(),
            load: load.clone(),
        }
    }

    pub fn render(&self, statement: &Statement) -> Result<String, WarehouseError> {
        let target = &self.target_table;
        let staging = &self.staging_table;

        let sql = match statement {
            Statement::DropStaging => format!("DROP TABLE IF EXISTS {staging}"),
            Statement::CreateStaging => format!("CREATE TEMP TABLE {staging} (LIKE {target})"),
            Statement::CopyIntoStaging { source_uri } => {
                let role = std::env::var(&self.load.role_env_var)
                    .map_err(|_| WarehouseError::MissingRole(self.load.role_env_var.clone()))?;
                self.render_copy(source_uri, &role)
            }
            Statement::DeleteMatchingStaging => {
                let predicate = KEY_COLUMNS
                    .iter()
                    .map(|column| format!("{target}.{column} = {staging}.{column}"))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                format!("DELETE FROM {target} USING {staging} WHERE {predicate}")
            }
            Statement::InsertFromStaging => {
                if self.load.columns.is_empty() {
                    format!("INSERT INTO {target} SELECT * FROM {staging}")
                } else {
                    let columns = self.load.columns.join(", ");
                    format!("INSERT INTO {target} ({columns}) SELECT {columns} FROM {staging}")
                }
            }
            Statement::Vacuum => format!("VACUUM {target}"),
            Statement::Analyze => format!("ANALYZE {target}"),
        };

        Ok(sql)
    }

    fn render_copy(&self, source_uri: &str, role: &str) -> String {
        let columns = if self.load.columns.is_empty() {
            String::new()
        } else {
            format!(" ({})", self.load.columns.join(", "))
        };

        format!(
            "COPY {staging}{columns} FROM {source} IAM_ROLE {role} CSV IGNOREHEADER {header} TIMEFORMAT AS {time_format} MAXERROR AS {max_errors}",
            staging = self.staging_table,
            source = quote_literal(source_uri),
            role = quote_literal(role),
            header = self.load.ignore_header_rows,
            time_format = quote_literal(&self.load.time_format),
            max_errors = self.load.max_errors,
        )
    }

    pub fn inventory_query(&self) -> String {
        format!(
            "SELECT start_date, org_name, MAX(inserted_at) AS last_inserted_at FROM {} GROUP BY start_date, org_name ORDER BY start_date DESC",
            self.target_table
        )
    }
}

/// Single-quote a string literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// A live warehouse connection.
///
/// Statements outside `begin`/`commit` run in autocommit mode, which is what
/// `VACUUM` and `ANALYZE` require.
#[async_trait]
pub trait WarehouseSession: Send {
    async fn begin(&mut self) -> Result<(), WarehouseError>;

    async fn commit(&mut self) -> Result<(), WarehouseError>;

    async fn rollback(&mut self) -> Result<(), WarehouseError>;

    /// Execute a statement and return the number of rows it affected.
    async fn execute(&mut self, statement: &Statement) -> Result<u64, WarehouseError>;

    async fn fetch_inventory(&mut self) -> Result<Vec<InventoryRecord>, WarehouseError>;

    /// Close the connection. Further calls fail with [`WarehouseError::Closed`].
    async fn close(&mut self) -> Result<(), WarehouseError>;
}

/// Opens warehouse sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn WarehouseSession>, WarehouseError>;
}
