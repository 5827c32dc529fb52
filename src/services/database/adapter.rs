// Backing-store capability trait and the handle returned by the connection manager
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;

use super::{EmbeddedHandle, FileBackedHandle, MySqlHandle, PostgresHandle, SourceKind};
use crate::api::middleware::AppError;
use crate::models::{Cell, Column, TabularBuffer};
use crate::services::query_builder::{BuiltQuery, QuerySource};

/// What every backing store can do for the query core
#[async_trait::async_trait]
pub trait BackingStore: Send {
    /// Run a built query and return at most `limit + 1` rows.
    ///
    /// Implementations enforce `timeout` themselves so they can cancel the
    /// running statement and leave pooled resources in a known-good state.
    async fn run_query(&mut self, query: &BuiltQuery, timeout: Duration) -> Result<TabularBuffer, AppError>;

    /// Output column names of a source, without fetching rows
    async fn probe_columns(&mut self, source: &QuerySource) -> Result<Vec<String>, AppError>;

    /// Round-trip to the store
    async fn test_connection(&mut self) -> Result<(), AppError>;
}

/// The three kinds of store, each with its own handle
pub enum StoreHandle {
    Postgres(PostgresHandle),
    MySql(MySqlHandle),
    Embedded(EmbeddedHandle),
    FileBacked(FileBackedHandle),
}

impl StoreHandle {
    fn store(&mut self) -> &mut dyn BackingStore {
        match self {
            StoreHandle::Postgres(handle) => handle,
            StoreHandle::MySql(handle) => handle,
            StoreHandle::Embedded(handle) => handle,
            StoreHandle::FileBacked(handle) => handle,
        }
    }
}

/// A live handle checked out from the connection manager.
///
/// Holds one of the per-descriptor permits; dropping the handle returns the
/// underlying connection to its pool and frees the permit.
pub struct ConnectionHandle {
    kind: SourceKind,
    fingerprint: String,
    store: StoreHandle,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionHandle {
    pub(crate) fn new(kind: SourceKind, fingerprint: String, store: StoreHandle, permit: OwnedSemaphorePermit) -> Self {
        Self {
            kind,
            fingerprint,
            store,
            _permit: permit,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The embedded session, when this handle is backed by one
    pub fn as_embedded(&self) -> Option<&EmbeddedHandle> {
        match &self.store {
            StoreHandle::Embedded(handle) => Some(handle),
            _ => None,
        }
    }
}

#[async_trait::async_trait]
impl BackingStore for ConnectionHandle {
    async fn run_query(&mut self, query: &BuiltQuery, timeout: Duration) -> Result<TabularBuffer, AppError> {
        self.store.store().run_query(query, timeout).await
    }

    async fn probe_columns(&mut self, source: &QuerySource) -> Result<Vec<String>, AppError> {
        self.store.store().probe_columns(source).await
    }

    async fn test_connection(&mut self) -> Result<(), AppError> {
        self.store.store().test_connection().await
    }
}

/// Assemble column-major result cells under the server's column names
pub(crate) fn result_buffer(names: Vec<String>, cells: Vec<Vec<Cell>>) -> Result<TabularBuffer, AppError> {
    let columns = names
        .into_iter()
        .zip(cells)
        .map(|(name, cells)| Column::new(name, cells))
        .collect();
    TabularBuffer::from_result_columns(columns).map_err(|e| AppError::QueryExecution(e.to_string()))
}

/// Timeout error shared by every store
pub(crate) fn timeout_error(timeout: Duration) -> AppError {
    AppError::QueryExecution(format!("Query timeout after {} seconds", timeout.as_secs()))
}
