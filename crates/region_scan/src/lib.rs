//! Partitioned, resumable table scans over region-sharded stores.
//!
//! A table scan is split into region-aligned partitions, each partition is read
//! by an independent reader borrowing a pooled store session, and raw rows are
//! turned into consumer records by a pluggable codec:
//! - [`SplitPlanner`] clips the table's region layout to the requested range,
//! - [`PartitionReader`] streams one partition with batched fetches, internal
//!   retry and resume-after-last-row on transient failures,
//! - [`ConnectionPool`] shares sessions per connection configuration,
//! - [`RowCodec`] decodes rows, and [`TableSource`] wires everything together.
//!
//! The store itself sits behind the [`StoreConnector`] / [`StoreSession`]
//! traits; [`MemoryStore`] is an in-process implementation.

pub mod codec;
pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod planner;
pub mod pool;
pub mod reader;
pub mod row;
pub mod source;
pub mod spec;
pub mod store;
pub mod topology;

pub use codec::{
    ColumnMapping, ColumnMappingCodec, DecodePolicy, Encoding, FieldValue, FnCodec, RawJsonCodec,
    RowCodec, TypedRecord, ValueKind,
};
pub use config::{ConnectionConfig, PoolOptions, RetryPolicy, ScanConfig};
pub use error::{DecodeError, Result, ScanContext, ScanError, StoreError};
pub use memory::{MemoryStore, StoreLayout};
pub use metrics::{ScanMetrics, ScanMetricsSnapshot};
pub use planner::{Partition, RegionFilter, SplitPlanner};
pub use pool::{ConnectionPool, PoolStats, PooledConnection, ShutdownReport};
pub use reader::{PartitionReader, ReaderOptions, ReaderState};
pub use row::{Cell, RawRow};
pub use source::{RecordReader, TableSource, TableSourceBuilder};
pub use spec::{ColumnSelector, KeyRange, ScanSpec, ScanSpecBuilder, ScanTemplate};
pub use store::{RowScanner, StoreConnector, StoreSession};
pub use topology::{RegionBoundary, TableTopology};
