//! Immutable scan descriptions.
//!
//! Keys follow the store convention used throughout the crate: an empty start
//! key means "from the first row" and an empty stop key means "to the last
//! row". Ranges are half-open, `[start, stop)`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};
use crate::topology::{key_in_range, max_bytes, min_end_bound};

/// Default number of rows fetched per round trip.
pub const DEFAULT_CACHE_SIZE: usize = 100;
/// Default number of cells fetched per round trip.
pub const DEFAULT_BATCH_SIZE: usize = 65_536;

/// Half-open key interval `[start, stop)` with empty bounds meaning unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    start: Vec<u8>,
    stop: Vec<u8>,
}

impl KeyRange {
    /// Builds a range, rejecting `start > stop` when both ends are bounded.
    pub fn new(start: impl Into<Vec<u8>>, stop: impl Into<Vec<u8>>) -> Result<Self> {
        let start = start.into();
        let stop = stop.into();
        if !start.is_empty() && !stop.is_empty() && start > stop {
            return Err(ScanError::InvalidArgument(format!(
                "start key {} sorts after stop key {}",
                hex::encode(&start),
                hex::encode(&stop)
            )));
        }
        Ok(Self { start, stop })
    }

    pub fn from_options(start: Option<Vec<u8>>, stop: Option<Vec<u8>>) -> Result<Self> {
        Self::new(start.unwrap_or_default(), stop.unwrap_or_default())
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self::default()
    }

    /// Raw start bound; empty means unbounded.
    pub fn start(&self) -> &[u8] {
        &self.start
    }

    /// Raw stop bound; empty means unbounded.
    pub fn stop(&self) -> &[u8] {
        &self.stop
    }

    pub fn start_key(&self) -> Option<&[u8]> {
        (!self.start.is_empty()).then_some(self.start.as_slice())
    }

    pub fn stop_key(&self) -> Option<&[u8]> {
        (!self.stop.is_empty()).then_some(self.stop.as_slice())
    }

    /// Returns `true` when no key can fall inside the range.
    pub fn is_empty(&self) -> bool {
        !self.stop.is_empty() && self.start >= self.stop
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key_in_range(key, &self.start, &self.stop)
    }

    /// Intersection of two ranges, or `None` when they do not overlap.
    pub fn intersect(&self, other: &KeyRange) -> Option<KeyRange> {
        let start = max_bytes(&self.start, &other.start);
        let stop = min_end_bound(&self.stop, &other.stop);
        let range = KeyRange { start, stop };
        (!range.is_empty()).then_some(range)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            display_bound(&self.start, "-inf"),
            display_bound(&self.stop, "+inf")
        )
    }
}

fn display_bound(key: &[u8], unbounded: &str) -> String {
    if key.is_empty() {
        unbounded.to_string()
    } else if key.iter().all(|b| b.is_ascii_graphic()) {
        String::from_utf8_lossy(key).into_owned()
    } else {
        format!("0x{}", hex::encode(key))
    }
}

/// Selects a whole column family or a single `family:qualifier` column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ColumnSelector {
    Family(Vec<u8>),
    Column { family: Vec<u8>, qualifier: Vec<u8> },
}

impl ColumnSelector {
    pub fn family(family: impl Into<Vec<u8>>) -> Self {
        Self::Family(family.into())
    }

    pub fn column(family: impl Into<Vec<u8>>, qualifier: impl Into<Vec<u8>>) -> Self {
        Self::Column {
            family: family.into(),
            qualifier: qualifier.into(),
        }
    }

    pub fn matches(&self, family: &[u8], qualifier: &[u8]) -> bool {
        match self {
            Self::Family(selected) => selected.as_slice() == family,
            Self::Column {
                family: selected_family,
                qualifier: selected_qualifier,
            } => selected_family.as_slice() == family && selected_qualifier.as_slice() == qualifier,
        }
    }
}

impl FromStr for ColumnSelector {
    type Err = ScanError;

    /// Parses `family` or `family:qualifier`.
    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        match raw.split_once(':') {
            None if !raw.is_empty() => Ok(Self::family(raw.as_bytes())),
            Some((family, qualifier)) if !family.is_empty() && !qualifier.is_empty() => {
                Ok(Self::column(family.as_bytes(), qualifier.as_bytes()))
            }
            _ => Err(ScanError::InvalidArgument(format!(
                "invalid column selector '{raw}', expected family or family:qualifier"
            ))),
        }
    }
}

impl fmt::Display for ColumnSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Family(family) => write!(f, "{}", String::from_utf8_lossy(family)),
            Self::Column { family, qualifier } => write!(
                f,
                "{}:{}",
                String::from_utf8_lossy(family),
                String::from_utf8_lossy(qualifier)
            ),
        }
    }
}

/// Immutable description of one scan over a table key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSpec {
    table_id: String,
    range: KeyRange,
    column_filters: BTreeSet<ColumnSelector>,
    batch_size: usize,
    cache_size: usize,
}

impl ScanSpec {
    pub fn builder(table_id: impl Into<String>) -> ScanSpecBuilder {
        ScanSpecBuilder::new(table_id)
    }

    pub fn table_id(&self) -> &str {
        &self.table_id
    }

    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    pub fn column_filters(&self) -> &BTreeSet<ColumnSelector> {
        &self.column_filters
    }

    /// Maximum number of cells fetched per round trip.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Maximum number of rows fetched per round trip.
    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    /// Returns `true` when the column passes the filter set (empty selects all).
    pub fn selects(&self, family: &[u8], qualifier: &[u8]) -> bool {
        self.column_filters.is_empty()
            || self
                .column_filters
                .iter()
                .any(|selector| selector.matches(family, qualifier))
    }

    /// Same scan restricted to another key range.
    pub fn with_range(&self, range: KeyRange) -> ScanSpec {
        ScanSpec {
            range,
            ..self.clone()
        }
    }
}

/// Validating builder for [`ScanSpec`].
#[derive(Debug, Clone)]
pub struct ScanSpecBuilder {
    table_id: String,
    range: KeyRange,
    column_filters: BTreeSet<ColumnSelector>,
    batch_size: usize,
    cache_size: usize,
}

impl ScanSpecBuilder {
    fn new(table_id: impl Into<String>) -> Self {
        Self {
            table_id: table_id.into(),
            range: KeyRange::full(),
            column_filters: BTreeSet::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }

    pub fn range(mut self, range: KeyRange) -> Self {
        self.range = range;
        self
    }

    pub fn column(mut self, selector: ColumnSelector) -> Self {
        self.column_filters.insert(selector);
        self
    }

    pub fn columns(mut self, selectors: impl IntoIterator<Item = ColumnSelector>) -> Self {
        self.column_filters.extend(selectors);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn build(self) -> Result<ScanSpec> {
        if self.table_id.trim().is_empty() {
            return Err(ScanError::InvalidArgument(
                "scan requires a table identifier".to_string(),
            ));
        }
        if self.cache_size == 0 {
            return Err(ScanError::InvalidArgument(
                "cache size must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ScanError::InvalidArgument(
                "batch size must be at least 1".to_string(),
            ));
        }
        Ok(ScanSpec {
            table_id: self.table_id,
            range: self.range,
            column_filters: self.column_filters,
            batch_size: self.batch_size,
            cache_size: self.cache_size,
        })
    }
}

/// Table-independent scan settings injected by the consumer.
///
/// A template turns into a [`ScanSpec`] once the planner knows the table and
/// the key range of a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTemplate {
    pub column_filters: BTreeSet<ColumnSelector>,
    pub batch_size: usize,
    pub cache_size: usize,
}

impl Default for ScanTemplate {
    fn default() -> Self {
        Self {
            column_filters: BTreeSet::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

impl ScanTemplate {
    pub fn spec_for(&self, table_id: &str, range: KeyRange) -> Result<ScanSpec> {
        ScanSpec::builder(table_id)
            .range(range)
            .columns(self.column_filters.iter().cloned())
            .batch_size(self.batch_size)
            .cache_size(self.cache_size)
            .build()
    }
}
