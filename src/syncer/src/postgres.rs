//! Warehouse sessions over the Postgres wire protocol (Redshift).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use common::config::{BulkLoadConfig, WarehouseConfig};
use sqlx::{Connection, PgConnection, Row};

use crate::error::WarehouseError;
use crate::warehouse::{Connector, InventoryRecord, SqlRenderer, Statement, WarehouseSession};

#[derive(Debug, Clone)]
pub struct PgConnector {
    dsn: String,
    connect_timeout: Duration,
    renderer: SqlRenderer,
}

impl PgConnector {
    pub fn new(warehouse: &WarehouseConfig, load: &BulkLoadConfig) -> Self {
        Self {
            dsn: warehouse.dsn.clone(),
            connect_timeout: warehouse.connect_timeout,
            renderer: SqlRenderer::new(warehouse, load),
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn WarehouseSession>, WarehouseError> {
        let conn = tokio::time::timeout(self.connect_timeout, PgConnection::connect(&self.dsn))
            .await
            .map_err(|_| WarehouseError::ConnectTimeout(self.connect_timeout))?
            .map_err(|e| WarehouseError::Connect(e.to_string()))?;

        log::debug!("Connected to warehouse");
        Ok(Box::new(PgSession {
            conn: Some(conn),
            renderer: self.renderer.clone(),
        }))
    }
}

pub struct PgSession {
    conn: Option<PgConnection>,
    renderer: SqlRenderer,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PgConnection, WarehouseError> {
        self.conn.as_mut().ok_or(WarehouseError::Closed)
    }

    async fn run(&mut self, sql: &str) -> Result<u64, WarehouseError> {
        log::trace!("Executing: {sql}");
        let conn = self.conn()?;
        let result = sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WarehouseSession for PgSession {
    async fn begin(&mut self) -> Result<(), WarehouseError> {
        self.run("BEGIN").await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<(), WarehouseError> {
        self.run("COMMIT").await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<(), WarehouseError> {
        self.run("ROLLBACK").await.map(|_| ())
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64, WarehouseError> {
        let sql = self.renderer.render(statement)?;
        self.run(&sql).await
    }

    async fn fetch_inventory(&mut self) -> Result<Vec<InventoryRecord>, WarehouseError> {
        let sql = self.renderer.inventory_query();
        let conn = self.conn()?;
        let rows = sqlx::Executor::fetch_all(conn, sqlx::query(&sql)).await?;

        rows.iter()
            .map(|row| -> Result<InventoryRecord, WarehouseError> {
                let start_date: NaiveDate = row.try_get("start_date")?;
                let org_name: String = row.try_get("org_name")?;
                let last_inserted_at: NaiveDateTime = row.try_get("last_inserted_at")?;
                Ok(InventoryRecord {
                    start_date,
                    org_name,
                    last_inserted_at: last_inserted_at.and_utc(),
                })
            })
            .collect()
    }

    async fn close(&mut self) -> Result<(), WarehouseError> {
        let conn = self.conn.take().ok_or(WarehouseError::Closed)?;
        conn.close().await?;
        Ok(())
    }
}
