//! Test utilities for the syncer.
//!
//! [`InMemoryWarehouse`] is a warehouse double that honours the parts of
//! the session contract the engine relies on. Staging tables are private to
//! their session, a rollback restores the state seen at `begin`, and
//! `VACUUM`/`ANALYZE` are refused inside a transaction. Failures can be
//! injected per statement kind.
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! syncer = { path = "src/syncer", features = ["testing"] }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::time::Instant;

use crate::error::WarehouseError;
use crate::shutdown::ShutdownTrigger;
use crate::warehouse::{Connector, InventoryRecord, Statement, StatementKind, WarehouseSession};

/// A row of the target (or staging) table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseRow {
    pub start_date: NaiveDate,
    pub org_id: String,
    pub org_name: String,
    pub inserted_at: DateTime<Utc>,
    pub payload: String,
}

impl WarehouseRow {
    pub fn new(
        start_date: NaiveDate,
        org_id: impl Into<String>,
        org_name: impl Into<String>,
        inserted_at: DateTime<Utc>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            start_date,
            org_id: org_id.into(),
            org_name: org_name.into(),
            inserted_at,
            payload: payload.into(),
        }
    }

    fn same_key(&self, other: &WarehouseRow) -> bool {
        self.start_date == other.start_date
            && self.org_id == other.org_id
            && self.org_name == other.org_name
    }
}

/// One statement as seen by the warehouse, failed ones included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub session_id: u64,
    pub kind: StatementKind,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct State {
    target: Vec<WarehouseRow>,
    sources: BTreeMap<String, Vec<WarehouseRow>>,
    connect_failures: u32,
    statement_failures: HashMap<StatementKind, u32>,
    sessions_opened: u64,
    open_sessions: usize,
    journal: Vec<JournalEntry>,
    shutdown_on: Option<(StatementKind, ShutdownTrigger)>,
}

impl State {
    fn record(&mut self, session_id: u64, kind: StatementKind) -> Result<(), WarehouseError> {
        self.journal.push(JournalEntry {
            session_id,
            kind,
            at: Instant::now(),
        });

        if let Some((on, trigger)) = &self.shutdown_on {
            if *on == kind {
                trigger.trigger();
            }
        }

        match self.statement_failures.get_mut(&kind) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(WarehouseError::rejected(kind, "injected failure"))
            }
            _ => Ok(()),
        }
    }
}

/// Shared in-memory warehouse. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWarehouse {
    state: Arc<Mutex<State>>,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(InMemoryConnector {
            state: self.state.clone(),
        })
    }

    /// Replace the committed contents of the target table.
    pub fn seed_target(&self, rows: Vec<WarehouseRow>) {
        self.lock().target = rows;
    }

    /// Make rows loadable from `uri`. A COPY from a prefix of `uri` picks them up too.
    pub fn add_source(&self, uri: impl Into<String>, rows: Vec<WarehouseRow>) {
        self.lock().sources.entry(uri.into()).or_default().extend(rows);
    }

    pub fn target_rows(&self) -> Vec<WarehouseRow> {
        self.lock().target.clone()
    }

    /// Fail the next `times` connection attempts.
    pub fn fail_connects(&self, times: u32) {
        self.lock().connect_failures = times;
    }

    /// Reject the next `times` statements of the given kind.
    pub fn fail_statement(&self, kind: StatementKind, times: u32) {
        self.lock().statement_failures.insert(kind, times);
    }

    /// Fire `trigger` whenever a statement of `kind` is issued.
    pub fn trigger_shutdown_on(&self, kind: StatementKind, trigger: ShutdownTrigger) {
        self.lock().shutdown_on = Some((kind, trigger));
    }

    pub fn sessions_opened(&self) -> u64 {
        self.lock().sessions_opened
    }

    /// Sessions neither closed nor dropped.
    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.lock().journal.clone()
    }

    /// How many statements of `kind` were issued, successful or not.
    pub fn count(&self, kind: StatementKind) -> usize {
        self.lock().journal.iter().filter(|e| e.kind == kind).count()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
struct InMemoryConnector {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self) -> Result<Box<dyn WarehouseSession>, WarehouseError> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(WarehouseError::Connect("injected connect failure".to_string()));
        }

        state.sessions_opened += 1;
        state.open_sessions += 1;
        Ok(Box::new(InMemorySession {
            id: state.sessions_opened,
            state: self.state.clone(),
            staging: None,
            transaction: None,
            closed: false,
        }))
    }
}

#[derive(Debug, Clone)]
struct TransactionSnapshot {
    target: Vec<WarehouseRow>,
    staging: Option<Vec<WarehouseRow>>,
}

#[derive(Debug)]
struct InMemorySession {
    id: u64,
    state: Arc<Mutex<State>>,
    staging: Option<Vec<WarehouseRow>>,
    transaction: Option<TransactionSnapshot>,
    closed: bool,
}

/// Lock the shared state on behalf of a session. Takes the fields rather
/// than the session so the guard only borrows `state`.
fn lock_open(state: &Mutex<State>, closed: bool) -> Result<MutexGuard<'_, State>, WarehouseError> {
    if closed {
        return Err(WarehouseError::Closed);
    }
    Ok(state.lock().unwrap_or_else(|p| p.into_inner()))
}

impl InMemorySession {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl WarehouseSession for InMemorySession {
    async fn begin(&mut self) -> Result<(), WarehouseError> {
        let mut state = lock_open(&self.state, self.closed)?;
        state.record(self.id, StatementKind::Begin)?;
        if self.transaction.is_some() {
            return Err(WarehouseError::rejected(
                StatementKind::Begin,
                "a transaction is already in progress",
            ));
        }
        let snapshot = TransactionSnapshot {
            target: state.target.clone(),
            staging: self.staging.clone(),
        };
        drop(state);
        self.transaction = Some(snapshot);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), WarehouseError> {
        lock_open(&self.state, self.closed)?.record(self.id, StatementKind::Commit)?;
        if self.transaction.take().is_none() {
            return Err(WarehouseError::rejected(
                StatementKind::Commit,
                "no transaction in progress",
            ));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), WarehouseError> {
        let mut state = lock_open(&self.state, self.closed)?;
        state.record(self.id, StatementKind::Rollback)?;
        if let Some(snapshot) = self.transaction.take() {
            state.target = snapshot.target;
            drop(state);
            self.staging = snapshot.staging;
        }
        Ok(())
    }

    async fn execute(&mut self, statement: &Statement) -> Result<u64, WarehouseError> {
        let kind = statement.kind();
        let mut state = lock_open(&self.state, self.closed)?;
        state.record(self.id, kind)?;

        match statement {
            Statement::DropStaging => {
                drop(state);
                self.staging = None;
                Ok(0)
            }
            Statement::CreateStaging => {
                drop(state);
                if self.staging.is_some() {
                    return Err(WarehouseError::rejected(kind, "staging table already exists"));
                }
                self.staging = Some(Vec::new());
                Ok(0)
            }
            Statement::CopyIntoStaging { source_uri } => {
                let nested = format!("{source_uri}/");
                let rows: Vec<_> = state
                    .sources
                    .iter()
                    .filter(|(uri, _)| *uri == source_uri || uri.starts_with(&nested))
                    .flat_map(|(_, rows)| rows.iter().cloned())
                    .collect();
                drop(state);

                let Some(staging) = self.staging.as_mut() else {
                    return Err(WarehouseError::rejected(kind, "staging table does not exist"));
                };
                if rows.is_empty() {
                    return Err(WarehouseError::rejected(
                        kind,
                        format!("no files found under {source_uri}"),
                    ));
                }
                let loaded = rows.len() as u64;
                staging.extend(rows);
                Ok(loaded)
            }
            Statement::DeleteMatchingStaging => {
                let Some(staging) = self.staging.as_ref() else {
                    return Err(WarehouseError::rejected(kind, "staging table does not exist"));
                };
                let before = state.target.len();
                state
                    .target
                    .retain(|row| !staging.iter().any(|staged| staged.same_key(row)));
                Ok((before - state.target.len()) as u64)
            }
            Statement::InsertFromStaging => {
                let Some(staging) = self.staging.as_ref() else {
                    return Err(WarehouseError::rejected(kind, "staging table does not exist"));
                };
                state.target.extend(staging.iter().cloned());
                Ok(staging.len() as u64)
            }
            Statement::Vacuum | Statement::Analyze => {
                if self.transaction.is_some() {
                    return Err(WarehouseError::rejected(
                        kind,
                        "cannot run inside a transaction block",
                    ));
                }
                Ok(0)
            }
        }
    }

    async fn fetch_inventory(&mut self) -> Result<Vec<InventoryRecord>, WarehouseError> {
        let mut state = lock_open(&self.state, self.closed)?;
        state.record(self.id, StatementKind::Inventory)?;

        let mut groups: BTreeMap<(NaiveDate, String), DateTime<Utc>> = BTreeMap::new();
        for row in &state.target {
            let latest = groups
                .entry((row.start_date, row.org_name.clone()))
                .or_insert(row.inserted_at);
            if row.inserted_at > *latest {
                *latest = row.inserted_at;
            }
        }

        Ok(groups
            .into_iter()
            .rev()
            .map(|((start_date, org_name), last_inserted_at)| InventoryRecord {
                start_date,
                org_name,
                last_inserted_at,
            })
            .collect())
    }

    async fn close(&mut self) -> Result<(), WarehouseError> {
        if self.closed {
            return Err(WarehouseError::Closed);
        }
        self.release();
        Ok(())
    }
}
