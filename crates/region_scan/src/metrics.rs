//! In-process counters for partition scans and connection pooling.
//!
//! Counters are lock-free so they can be bumped on the per-row hot path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Aggregated counters shared by readers and the pool.
#[derive(Debug, Default)]
pub struct ScanMetrics {
    /// Partitions planned across all `plan` calls.
    partitions_planned: AtomicU64,
    /// Readers that reached the streaming state.
    scans_opened: AtomicU64,
    /// Readers closed through `close` or exhaustion.
    scans_closed: AtomicU64,
    /// Rows handed to callers.
    rows_delivered: AtomicU64,
    /// Bytes of delivered rows.
    bytes_delivered: AtomicU64,
    /// Store round trips that returned at least one row.
    batches_fetched: AtomicU64,
    /// Rows dropped because they were at or before the resume point.
    duplicate_rows_skipped: AtomicU64,
    /// Transient failures retried internally.
    scan_retries: AtomicU64,
    /// Scans re-opened after the last delivered row.
    scan_resumes: AtomicU64,
    /// Scans stopped by cancellation or deadline.
    scans_cancelled: AtomicU64,
    /// Rows that failed to decode.
    decode_failures: AtomicU64,
    /// Rows skipped under the skip-and-log policy.
    rows_skipped: AtomicU64,
    /// Sessions created by the connector.
    connections_opened: AtomicU64,
    /// Acquisitions served from an idle session.
    connections_reused: AtomicU64,
    /// Sessions closed after being discarded.
    connections_discarded: AtomicU64,
    /// Acquisitions that failed on timeout or shutdown.
    pool_timeouts: AtomicU64,
    /// Sum of time spent waiting for a pool slot, in nanoseconds.
    pool_wait_ns_total: AtomicU64,
}

/// Immutable snapshot view of [`ScanMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanMetricsSnapshot {
    pub partitions_planned: u64,
    pub scans_opened: u64,
    pub scans_closed: u64,
    pub rows_delivered: u64,
    pub bytes_delivered: u64,
    pub batches_fetched: u64,
    pub duplicate_rows_skipped: u64,
    pub scan_retries: u64,
    pub scan_resumes: u64,
    pub scans_cancelled: u64,
    pub decode_failures: u64,
    pub rows_skipped: u64,
    pub connections_opened: u64,
    pub connections_reused: u64,
    pub connections_discarded: u64,
    pub pool_timeouts: u64,
    pub pool_wait_ns_total: u64,
}

impl ScanMetrics {
    pub fn record_partitions_planned(&self, count: usize) {
        self.partitions_planned
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_scan_opened(&self) {
        self.scans_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan_closed(&self) {
        self.scans_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_row_delivered(&self, bytes: usize) {
        self.rows_delivered.fetch_add(1, Ordering::Relaxed);
        self.bytes_delivered
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicates_skipped(&self, count: usize) {
        self.duplicate_rows_skipped
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_scan_retry(&self) {
        self.scan_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan_resume(&self) {
        self.scan_resumes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan_cancelled(&self) {
        self.scans_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_row_skipped(&self) {
        self.rows_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_reused(&self) {
        self.connections_reused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_discarded(&self) {
        self.connections_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_timeout(&self) {
        self.pool_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pool_wait(&self, waited: Duration) {
        let nanos = u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX);
        self.pool_wait_ns_total.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ScanMetricsSnapshot {
        ScanMetricsSnapshot {
            partitions_planned: self.partitions_planned.load(Ordering::Relaxed),
            scans_opened: self.scans_opened.load(Ordering::Relaxed),
            scans_closed: self.scans_closed.load(Ordering::Relaxed),
            rows_delivered: self.rows_delivered.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            batches_fetched: self.batches_fetched.load(Ordering::Relaxed),
            duplicate_rows_skipped: self.duplicate_rows_skipped.load(Ordering::Relaxed),
            scan_retries: self.scan_retries.load(Ordering::Relaxed),
            scan_resumes: self.scan_resumes.load(Ordering::Relaxed),
            scans_cancelled: self.scans_cancelled.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            rows_skipped: self.rows_skipped.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_reused: self.connections_reused.load(Ordering::Relaxed),
            connections_discarded: self.connections_discarded.load(Ordering::Relaxed),
            pool_timeouts: self.pool_timeouts.load(Ordering::Relaxed),
            pool_wait_ns_total: self.pool_wait_ns_total.load(Ordering::Relaxed),
        }
    }
}
