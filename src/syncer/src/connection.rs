//! Ownership of the single warehouse connection.
//!
//! Exactly one session is "current" at a time. SyncWorker and
//! MaintenanceScheduler share the manager behind a mutex and hand the
//! connection over only between transactions.

use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::warehouse::{Connector, WarehouseSession};

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    current: Option<Box<dyn WarehouseSession>>,
    connections_opened: u64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            current: None,
            connections_opened: 0,
        }
    }

    /// Open a connection and make it current, closing any prior one.
    pub async fn create(&mut self) -> Result<()> {
        log::debug!("Creating warehouse connection");
        self.close_current().await;

        let session = self.connector.connect().await?;
        self.current = Some(session);
        self.connections_opened += 1;
        Ok(())
    }

    /// Close every tracked connection. [`create`](Self::create) must be
    /// called again before further statements.
    pub async fn kill_all(&mut self) {
        log::debug!("Closing all warehouse connections");
        self.close_current().await;
    }

    /// Kill and recreate the current connection.
    pub async fn recycle(&mut self) -> Result<()> {
        self.kill_all().await;
        self.create().await
    }

    /// The current connection.
    pub fn current(&mut self) -> Result<&mut (dyn WarehouseSession + 'static)> {
        self.current.as_deref_mut().ok_or(SyncError::NoConnection)
    }

    /// The current connection, creating one first if none is open.
    pub async fn current_or_create(&mut self) -> Result<&mut (dyn WarehouseSession + 'static)> {
        if self.current.is_none() {
            self.create().await?;
        }
        self.current()
    }

    /// The connector behind this manager. Sessions it opens are outside the
    /// manager's tracking and must be closed by the caller.
    pub fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.current.is_some()
    }

    /// Number of tracked connections opened over the manager's lifetime.
    pub fn connections_opened(&self) -> u64 {
        self.connections_opened
    }

    async fn close_current(&mut self) {
        if let Some(mut session) = self.current.take() {
            if let Err(e) = session.close().await {
                log::warn!("Failed to close warehouse connection cleanly: {e}");
            }
        }
    }
}
