//! Store-facing seams: connecting, region metadata, and resumable scans.
//!
//! Implementations wrap a concrete client (or, for tests and the CLI, the
//! in-memory [`MemoryStore`](crate::memory::MemoryStore)). Everything above
//! this module only talks to these traits.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::error::StoreError;
use crate::row::RawRow;
use crate::spec::ScanSpec;
use crate::topology::RegionBoundary;

/// Creates sessions for a connection configuration.
#[async_trait]
pub trait StoreConnector: Send + Sync + 'static {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn StoreSession>, StoreError>;
}

/// An established connection to the store.
#[async_trait]
pub trait StoreSession: Send + Sync + 'static {
    /// Region boundaries of `table`, in any order. An existing table without
    /// regions returns an empty list; an unknown table fails with
    /// [`StoreError::TableNotFound`].
    async fn region_boundaries(&self, table: &str) -> Result<Vec<RegionBoundary>, StoreError>;

    /// Resolves the table handle, failing when the table does not exist.
    async fn resolve_table(&self, table: &str) -> Result<(), StoreError>;

    /// Whether `open_scanner` honours `resume_after`.
    fn supports_resume(&self) -> bool;

    /// Opens a cursor over `spec`. When `resume_after` is set, the cursor
    /// starts strictly after that row key.
    async fn open_scanner(
        &self,
        spec: &ScanSpec,
        resume_after: Option<&[u8]>,
    ) -> Result<Box<dyn RowScanner>, StoreError>;

    /// Releases server-side resources held by the session.
    async fn close(&self) {}
}

/// Forward-only cursor over the rows of one scan.
#[async_trait]
pub trait RowScanner: Send {
    /// Fetches up to `max_rows` rows, stopping early once `max_cells` cells
    /// have been collected (a row is never split). An empty batch means the
    /// cursor is exhausted.
    async fn next_batch(
        &mut self,
        max_rows: usize,
        max_cells: usize,
    ) -> Result<Vec<RawRow>, StoreError>;

    async fn close(&mut self) {}
}
