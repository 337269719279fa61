use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "partsync.toml";

/// Environment variable prefix; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "PARTSYNC__";

/// Connection settings for the columnar warehouse.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// Postgres-protocol DSN of the warehouse
    pub dsn: String,
    /// Table that readers query
    pub target_table: String,
    /// Session-scoped table new rows are landed in before the swap
    pub staging_table: String,
    /// Upper bound for establishing a connection
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("postgres://localhost:5439/warehouse"),
            target_table: String::from("pub_master"),
            staging_table: String::from("pub_staging"),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Object storage holding the partition files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Store DSN (`s3://bucket`, `file:///path`, `memory://`)
    pub dsn: String,
    /// Key prefix under which `date=<YYYY-MM-DD>/<org_name>` objects live
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("memory://"),
            prefix: String::from("temp"),
        }
    }
}

/// Options of the warehouse bulk-load (COPY) statement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BulkLoadConfig {
    /// URI the warehouse reads partition files from, e.g. `s3://temp`
    pub source_root: String,
    /// Name of the environment variable carrying the load role reference
    pub role_env_var: String,
    /// Explicit column list; empty means the table's own column order
    #[serde(default)]
    pub columns: Vec<String>,
    pub time_format: String,
    pub ignore_header_rows: u32,
    /// Malformed rows tolerated before the load fails
    pub max_errors: u32,
}

impl Default for BulkLoadConfig {
    fn default() -> Self {
        Self {
            source_root: String::from("s3://temp"),
            role_env_var: String::from("ROLE"),
            columns: Vec::new(),
            time_format: String::from("YYYY-MM-DD HH24:MI:SS"),
            ignore_header_rows: 1,
            max_errors: 10,
        }
    }
}

/// Granularity of reconciliation decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessBy {
    /// Reload whole dates
    #[default]
    Date,
    /// Reload individual `(date, org)` partitions
    DateOrg,
}

impl fmt::Display for ProcessBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessBy::Date => write!(f, "date"),
            ProcessBy::DateOrg => write!(f, "dateorg"),
        }
    }
}

impl FromStr for ProcessBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "date" => Ok(ProcessBy::Date),
            "dateorg" => Ok(ProcessBy::DateOrg),
            other => Err(format!(
                "invalid process-by value '{other}', expected 'date' or 'dateorg'"
            )),
        }
    }
}

/// Reconciliation, retry and maintenance policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    pub process_by: ProcessBy,
    /// Age after which an unchanged partition is reloaded anyway
    #[serde(with = "humantime_serde")]
    pub staleness_threshold: Duration,
    /// Total swap attempts per decision, including the first
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Maintenance runs on the first decision and every N-th after it
    pub maintenance_interval: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            process_by: ProcessBy::Date,
            staleness_threshold: Duration::from_secs(5 * 24 * 3600),
            max_attempts: 2,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            maintenance_interval: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    pub warehouse: WarehouseConfig,
    pub storage: StorageConfig,
    pub bulk_load: BulkLoadConfig,
    pub sync: SyncConfig,
}

impl Configuration {
    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
    }

    /// Load defaults, `partsync.toml` from the working directory, then `PARTSYNC__*` env vars.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Self::figment()
            .merge(Toml::file(DEFAULT_CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    /// Same layering as [`Configuration::load`] with an explicit file.
    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        let config = Self::figment()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.warehouse.dsn.is_empty() {
            anyhow::bail!("warehouse.dsn cannot be empty");
        }
        if self.storage.dsn.is_empty() {
            anyhow::bail!("storage.dsn cannot be empty");
        }
        if self.bulk_load.source_root.is_empty() {
            anyhow::bail!("bulk_load.source_root cannot be empty");
        }
        if self.bulk_load.role_env_var.is_empty() {
            anyhow::bail!("bulk_load.role_env_var cannot be empty");
        }

        for (name, value) in [
            ("warehouse.target_table", &self.warehouse.target_table),
            ("warehouse.staging_table", &self.warehouse.staging_table),
        ] {
            if !is_sql_identifier(value) {
                anyhow::bail!("{name} must be a plain SQL identifier, got '{value}'");
            }
        }
        // Temporary tables live in a session schema and cannot be qualified
        if self.warehouse.staging_table.contains('.') {
            anyhow::bail!(
                "warehouse.staging_table must be unqualified, got '{}'",
                self.warehouse.staging_table
            );
        }
        if self.warehouse.target_table == self.warehouse.staging_table {
            anyhow::bail!("warehouse.staging_table must differ from warehouse.target_table");
        }
        if let Some(column) = self
            .bulk_load
            .columns
            .iter()
            .find(|c| !is_sql_identifier(c))
        {
            anyhow::bail!("bulk_load.columns contains an invalid identifier '{column}'");
        }

        if self.sync.max_attempts == 0 {
            anyhow::bail!("sync.max_attempts must be positive");
        }
        if self.sync.maintenance_interval == 0 {
            anyhow::bail!("sync.maintenance_interval must be positive");
        }
        if self.sync.initial_backoff > self.sync.max_backoff {
            anyhow::bail!(
                "sync.initial_backoff ({:?}) exceeds sync.max_backoff ({:?})",
                self.sync.initial_backoff,
                self.sync.max_backoff
            );
        }

        Ok(())
    }
}

/// `name` or `schema.name`, ASCII letters, digits and underscores only.
pub fn is_sql_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.split('.').all(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                }
                _ => false,
            }
        })
}
