//! In-memory region store.
//!
//! Backs the test suites and `scanctl`. Tables keep their rows in a sorted map
//! and carry an explicit region layout; scans honour column filters, batch
//! limits and resume keys exactly like a remote store would. Faults can be
//! injected to exercise retry and resume paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::error::StoreError;
use crate::row::{Cell, RawRow};
use crate::spec::ScanSpec;
use crate::store::{RowScanner, StoreConnector, StoreSession};
use crate::topology::{regions_from_splits, RegionBoundary, TableTopology};

#[derive(Debug, Default)]
struct MemoryTable {
    regions: Vec<RegionBoundary>,
    rows: BTreeMap<Vec<u8>, Vec<Cell>>,
}

#[derive(Debug)]
struct RowFault {
    table: String,
    after_key: Vec<u8>,
    remaining: usize,
}

#[derive(Debug, Default)]
struct Faults {
    connect_failures: usize,
    fetch_failures: HashMap<String, usize>,
    fatal_fetches: HashMap<String, usize>,
    stalled_tables: HashSet<String>,
    row_failures: Vec<RowFault>,
}

/// Injected outcome of a single fetch.
enum FetchFault {
    Transient,
    Fatal,
    Stall,
}

impl Faults {
    fn take_fetch_fault(&mut self, table: &str) -> Option<FetchFault> {
        if self.stalled_tables.contains(table) {
            return Some(FetchFault::Stall);
        }
        if take_one(&mut self.fatal_fetches, table) {
            return Some(FetchFault::Fatal);
        }
        take_one(&mut self.fetch_failures, table).then_some(FetchFault::Transient)
    }

    /// Consumes one pending failure registered for `key`, if any.
    fn trip(&mut self, table: &str, key: &[u8]) -> bool {
        match self
            .row_failures
            .iter_mut()
            .find(|fault| fault.remaining > 0 && fault.table == table && fault.after_key == key)
        {
            Some(fault) => {
                fault.remaining -= 1;
                true
            }
            None => false,
        }
    }
}

fn take_one(pending: &mut HashMap<String, usize>, table: &str) -> bool {
    match pending.get_mut(table) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

#[derive(Debug)]
struct MemoryInner {
    tables: RwLock<HashMap<String, MemoryTable>>,
    faults: Mutex<Faults>,
    resume_supported: AtomicBool,
    connects: AtomicU64,
    sessions_closed: AtomicU64,
    scans_opened: AtomicU64,
}

/// Cloneable handle to a shared in-memory store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                tables: RwLock::new(HashMap::new()),
                faults: Mutex::new(Faults::default()),
                resume_supported: AtomicBool::new(true),
                connects: AtomicU64::new(0),
                sessions_closed: AtomicU64::new(0),
                scans_opened: AtomicU64::new(0),
            }),
        }
    }

    /// Creates (or replaces) a table with the given region layout.
    pub fn create_table(
        &self,
        table: impl Into<String>,
        regions: Vec<RegionBoundary>,
    ) -> Result<(), StoreError> {
        let topology = TableTopology::from_regions(table, regions)?;
        let mut tables = self
            .inner
            .tables
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        tables.insert(
            topology.table,
            MemoryTable {
                regions: topology.regions,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Inserts rows, appending cells to rows that already exist.
    pub fn load_rows(
        &self,
        table: &str,
        rows: impl IntoIterator<Item = RawRow>,
    ) -> Result<(), StoreError> {
        let mut tables = self
            .inner
            .tables
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        for row in rows {
            let cells = entry.rows.entry(row.row_key).or_default();
            cells.extend(row.cells);
            // Re-sort through RawRow so merged cells keep the store ordering.
            let merged = RawRow::new(Vec::new(), std::mem::take(cells));
            *cells = merged.cells;
        }
        Ok(())
    }

    /// Makes the next `times` scans that deliver `row_key` fail right after it.
    pub fn fail_after_row(&self, table: &str, row_key: impl Into<Vec<u8>>, times: usize) {
        let mut faults = self
            .inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        faults.row_failures.push(RowFault {
            table: table.to_string(),
            after_key: row_key.into(),
            remaining: times,
        });
    }

    /// Makes the next `count` batch fetches on `table` fail transiently
    /// before returning any row.
    pub fn fail_next_fetches(&self, table: &str, count: usize) {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fetch_failures
            .insert(table.to_string(), count);
    }

    /// Makes the next `count` batch fetches on `table` fail with a
    /// non-retryable store error.
    pub fn fail_next_fetches_fatally(&self, table: &str, count: usize) {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fatal_fetches
            .insert(table.to_string(), count);
    }

    /// Makes every later batch fetch on `table` hang until the caller stops
    /// waiting.
    pub fn stall_fetches(&self, table: &str) {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stalled_tables
            .insert(table.to_string());
    }

    /// Makes the next `count` connection attempts fail transiently.
    pub fn fail_connects(&self, count: usize) {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connect_failures = count;
    }

    pub fn set_resume_supported(&self, supported: bool) {
        self.inner
            .resume_supported
            .store(supported, Ordering::SeqCst);
    }

    /// Successful connections made so far.
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Sessions closed so far, by the pool or by their owner.
    pub fn sessions_closed(&self) -> u64 {
        self.inner.sessions_closed.load(Ordering::SeqCst)
    }

    /// Scanners opened so far, including resumed ones.
    pub fn scans_opened(&self) -> u64 {
        self.inner.scans_opened.load(Ordering::SeqCst)
    }

    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.inner
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .map(|entry| entry.rows.len())
    }

    /// Builds a store from a parsed JSON layout.
    pub fn from_layout(layout: &StoreLayout) -> anyhow::Result<Self> {
        let store = Self::new();
        if let Some(supported) = layout.resume_supported {
            store.set_resume_supported(supported);
        }
        for table in &layout.tables {
            let splits = table
                .splits
                .iter()
                .map(|split| decode_text(split))
                .collect::<anyhow::Result<Vec<_>>>()
                .with_context(|| format!("decode splits of table {}", table.name))?;
            let regions = regions_from_splits(&splits, &table.owners)
                .with_context(|| format!("build regions of table {}", table.name))?;
            store
                .create_table(table.name.clone(), regions)
                .with_context(|| format!("create table {}", table.name))?;

            let rows = table
                .rows
                .iter()
                .map(RowLayout::to_raw_row)
                .collect::<anyhow::Result<Vec<_>>>()
                .with_context(|| format!("decode rows of table {}", table.name))?;
            store
                .load_rows(&table.name, rows)
                .with_context(|| format!("load rows of table {}", table.name))?;
        }
        Ok(store)
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn StoreSession>, StoreError> {
        {
            let mut faults = self
                .inner
                .faults
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if faults.connect_failures > 0 {
                faults.connect_failures -= 1;
                return Err(StoreError::Transient(format!(
                    "injected connect failure for {}",
                    config.endpoint
                )));
            }
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemorySession {
            inner: self.inner.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemorySession {
    inner: Arc<MemoryInner>,
    closed: AtomicBool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Fatal("session is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn region_boundaries(&self, table: &str) -> Result<Vec<RegionBoundary>, StoreError> {
        self.ensure_open()?;
        let tables = self
            .inner
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        tables
            .get(table)
            .map(|entry| entry.regions.clone())
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }

    async fn resolve_table(&self, table: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let tables = self
            .inner
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if tables.contains_key(table) {
            Ok(())
        } else {
            Err(StoreError::TableNotFound(table.to_string()))
        }
    }

    fn supports_resume(&self) -> bool {
        self.inner.resume_supported.load(Ordering::SeqCst)
    }

    async fn open_scanner(
        &self,
        spec: &ScanSpec,
        resume_after: Option<&[u8]>,
    ) -> Result<Box<dyn RowScanner>, StoreError> {
        self.ensure_open()?;
        self.resolve_table(spec.table_id()).await?;
        if resume_after.is_some() && !self.supports_resume() {
            return Err(StoreError::Fatal(
                "store does not support resuming scans".to_string(),
            ));
        }
        self.inner.scans_opened.fetch_add(1, Ordering::SeqCst);
        debug!(
            table = spec.table_id(),
            range = %spec.range(),
            resume_after = ?resume_after.map(hex::encode),
            "memory scanner opened"
        );
        Ok(Box::new(MemoryScanner {
            inner: self.inner.clone(),
            spec: spec.clone(),
            position: resume_after.map(<[u8]>::to_vec),
            poisoned: None,
            closed: false,
        }))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct MemoryScanner {
    inner: Arc<MemoryInner>,
    spec: ScanSpec,
    /// Last row key handed out; the next batch starts strictly after it.
    position: Option<Vec<u8>>,
    /// Set when an injected fault fired; every later fetch fails.
    poisoned: Option<Vec<u8>>,
    closed: bool,
}

impl MemoryScanner {
    fn lower_bound(&self) -> Bound<Vec<u8>> {
        match &self.position {
            Some(key) => Bound::Excluded(key.clone()),
            None => match self.spec.range().start_key() {
                Some(start) => Bound::Included(start.to_vec()),
                None => Bound::Unbounded,
            },
        }
    }
}

#[async_trait]
impl RowScanner for MemoryScanner {
    async fn next_batch(
        &mut self,
        max_rows: usize,
        max_cells: usize,
    ) -> Result<Vec<RawRow>, StoreError> {
        if self.closed {
            return Err(StoreError::Fatal("scanner is closed".to_string()));
        }
        if let Some(key) = &self.poisoned {
            return Err(StoreError::Transient(format!(
                "injected failure after row {}",
                hex::encode(key)
            )));
        }
        let injected = self
            .inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take_fetch_fault(self.spec.table_id());
        match injected {
            Some(FetchFault::Transient) => {
                return Err(StoreError::Transient("injected fetch failure".to_string()))
            }
            Some(FetchFault::Fatal) => {
                return Err(StoreError::Fatal("injected fatal fetch failure".to_string()))
            }
            Some(FetchFault::Stall) => std::future::pending::<()>().await,
            None => {}
        }

        let lower = self.lower_bound();
        let upper = match self.spec.range().stop_key() {
            Some(stop) => {
                let past_stop = match &lower {
                    Bound::Included(key) | Bound::Excluded(key) => key.as_slice() >= stop,
                    Bound::Unbounded => false,
                };
                if past_stop {
                    return Ok(Vec::new());
                }
                Bound::Excluded(stop.to_vec())
            }
            None => Bound::Unbounded,
        };

        let tables = self
            .inner
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let table = tables
            .get(self.spec.table_id())
            .ok_or_else(|| StoreError::TableNotFound(self.spec.table_id().to_string()))?;

        let mut batch = Vec::new();
        let mut cells_in_batch = 0usize;
        for (key, cells) in table.rows.range((lower, upper)) {
            let selected = cells
                .iter()
                .filter(|cell| self.spec.selects(&cell.family, &cell.qualifier))
                .cloned()
                .collect::<Vec<_>>();
            self.position = Some(key.clone());
            // Rows without selected cells are not returned, as in the real store.
            if selected.is_empty() {
                continue;
            }
            cells_in_batch += selected.len();
            batch.push(RawRow {
                row_key: key.clone(),
                cells: selected,
            });

            let tripped = self
                .inner
                .faults
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .trip(self.spec.table_id(), key);
            if tripped {
                self.poisoned = Some(key.clone());
                break;
            }
            if batch.len() >= max_rows.max(1) || cells_in_batch >= max_cells.max(1) {
                break;
            }
        }
        Ok(batch)
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// JSON description of a store, used by `scanctl --layout`.
///
/// Keys, split points and values are UTF-8 text; prefix them with `hex:` to
/// give raw bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreLayout {
    #[serde(default)]
    pub resume_supported: Option<bool>,
    pub tables: Vec<TableLayout>,
}

/// One table of a [`StoreLayout`]: split points, region owners and rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableLayout {
    pub name: String,
    /// Region split points; `n` splits yield `n + 1` regions.
    #[serde(default)]
    pub splits: Vec<String>,
    /// Region owners, assigned round-robin.
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub rows: Vec<RowLayout>,
}

/// A row of a [`TableLayout`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowLayout {
    pub key: String,
    #[serde(default)]
    pub cells: Vec<CellLayout>,
}

/// A cell of a [`RowLayout`]; `timestamp` defaults to 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellLayout {
    pub family: String,
    pub qualifier: String,
    pub value: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl StoreLayout {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read layout {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse layout {}", path.display()))
    }
}

impl RowLayout {
    fn to_raw_row(&self) -> anyhow::Result<RawRow> {
        let cells = self
            .cells
            .iter()
            .map(|cell| {
                Ok(Cell::new(
                    decode_text(&cell.family)?,
                    decode_text(&cell.qualifier)?,
                    cell.timestamp,
                    decode_text(&cell.value)?,
                ))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(RawRow::new(decode_text(&self.key)?, cells))
    }
}

/// Decodes layout text, honouring the `hex:` prefix.
pub fn decode_text(raw: &str) -> anyhow::Result<Vec<u8>> {
    match raw.strip_prefix("hex:") {
        Some(encoded) => hex::decode(encoded).with_context(|| format!("invalid hex value: {raw}")),
        None => Ok(raw.as_bytes().to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::spec::{ColumnSelector, KeyRange};

    fn row(key: &str, cells: &[(&str, &str, &str)]) -> RawRow {
        RawRow::new(
            key.as_bytes(),
            cells
                .iter()
                .map(|(f, q, v)| Cell::new(*f, *q, 1, *v))
                .collect(),
        )
    }

    async fn seeded() -> (MemoryStore, Arc<dyn StoreSession>) {
        let store = MemoryStore::new();
        store
            .create_table("t", regions_from_splits(&[b"m".to_vec()], &[]).expect("regions"))
            .expect("table");
        store
            .load_rows(
                "t",
                (1..=6).map(|i| row(&format!("k{i}"), &[("cf", "a", "x"), ("cf", "b", "y")])),
            )
            .expect("rows");
        let session = store
            .connect(&ConnectionConfig::new("memory://test"))
            .await
            .expect("session");
        (store, session)
    }

    #[tokio::test]
    async fn batches_respect_row_and_cell_limits() {
        let (_, session) = seeded().await;
        let spec = ScanSpec::builder("t").build().expect("spec");
        let mut scanner = session.open_scanner(&spec, None).await.expect("scanner");

        let by_rows = scanner.next_batch(4, 1_000).await.expect("batch");
        assert_eq!(by_rows.len(), 4);
        // Three cells requested but rows are never split: two rows of two cells.
        let by_cells = scanner.next_batch(100, 3).await.expect("batch");
        assert_eq!(by_cells.len(), 2);
        assert!(scanner.next_batch(100, 100).await.expect("end").is_empty());
    }

    #[tokio::test]
    async fn resume_key_is_exclusive_and_filters_apply() {
        let (_, session) = seeded().await;
        let spec = ScanSpec::builder("t")
            .range(KeyRange::new(b"k2".to_vec(), b"k5".to_vec()).expect("range"))
            .column(ColumnSelector::column("cf", "b"))
            .build()
            .expect("spec");
        let mut scanner = session
            .open_scanner(&spec, Some(b"k2"))
            .await
            .expect("scanner");
        let rows = scanner.next_batch(10, 100).await.expect("batch");
        let keys = rows.iter().map(|r| r.row_key.clone()).collect::<Vec<_>>();
        assert_eq!(keys, vec![b"k3".to_vec(), b"k4".to_vec()]);
        assert!(rows.iter().all(|r| r.cells.len() == 1 && r.cells[0].qualifier == b"b"));
    }

    #[tokio::test]
    async fn injected_fault_truncates_batch_then_fails() {
        let (store, session) = seeded().await;
        store.fail_after_row("t", b"k2".to_vec(), 1);
        let spec = ScanSpec::builder("t").build().expect("spec");

        let mut scanner = session.open_scanner(&spec, None).await.expect("scanner");
        let rows = scanner.next_batch(10, 100).await.expect("batch");
        assert_eq!(rows.last().map(|r| r.row_key.clone()), Some(b"k2".to_vec()));
        let err = scanner.next_batch(10, 100).await.expect_err("fault");
        assert!(err.is_transient());

        // The fault fired once; a resumed scan passes through.
        let mut resumed = session.open_scanner(&spec, Some(b"k2")).await.expect("resume");
        assert_eq!(resumed.next_batch(10, 100).await.expect("batch").len(), 4);
    }

    #[tokio::test]
    async fn unknown_table_and_disabled_resume_are_reported() {
        let (store, session) = seeded().await;
        let missing = ScanSpec::builder("nope").build().expect("spec");
        assert!(matches!(
            session.open_scanner(&missing, None).await.err(),
            Some(StoreError::TableNotFound(_))
        ));

        store.set_resume_supported(false);
        assert!(!session.supports_resume());
        let spec = ScanSpec::builder("t").build().expect("spec");
        assert!(session.open_scanner(&spec, Some(b"k1")).await.is_err());
    }

    #[test]
    fn layout_file_builds_store() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"tables":[{{"name":"orders","splits":["f","m"],"owners":["rs1","rs2"],
                "rows":[{{"key":"c1","cells":[{{"family":"d","qualifier":"total","value":"hex:000000000000002a"}}]}},
                        {{"key":"p5","cells":[{{"family":"d","qualifier":"total","value":"7","timestamp":3}}]}}]}}]}}"#
        )
        .expect("write layout");

        let layout = StoreLayout::from_path(file.path()).expect("layout");
        let store = MemoryStore::from_layout(&layout).expect("store");
        assert_eq!(store.row_count("orders"), Some(2));
        assert_eq!(store.row_count("missing"), None);
        assert!(decode_text("hex:zz").is_err());
    }
}
