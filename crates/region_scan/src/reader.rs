//! Single-partition scan execution.
//!
//! A [`PartitionReader`] borrows one pooled session, opens a cursor over its
//! partition and hands rows out one at a time while fetching them in batches.
//! Transient store failures are absorbed by reopening the cursor strictly after
//! the last row handed out; whatever cannot be absorbed surfaces as a typed
//! [`ScanError`] carrying the table, range and last delivered key.
//!
//! State machine:
//!
//! ```text
//! Created -> Opening -> Streaming -> Closed
//!     \          \          \
//!      +----------+----------+--> Errored
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::config::{ConnectionConfig, RetryPolicy};
use crate::error::{Result, ScanContext, ScanError};
use crate::metrics::ScanMetrics;
use crate::planner::Partition;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::row::RawRow;
use crate::store::RowScanner;

/// Lifecycle of a [`PartitionReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Created,
    Opening,
    Streaming,
    Closed,
    Errored,
}

impl ReaderState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Opening => "opening",
            Self::Streaming => "streaming",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-reader execution controls.
#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    pub retry: RetryPolicy,
    /// Cancelling the token stops the scan at the next await point.
    pub cancel: CancellationToken,
    /// Absolute deadline; treated exactly like cancellation once reached.
    pub deadline: Option<Instant>,
}

impl ReaderOptions {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Streams the rows of one [`Partition`] over a pooled session.
pub struct PartitionReader {
    partition: Partition,
    pool: Arc<ConnectionPool>,
    connection_config: ConnectionConfig,
    options: ReaderOptions,
    metrics: Arc<ScanMetrics>,
    state: ReaderState,
    connection: Option<PooledConnection>,
    scanner: Option<Box<dyn RowScanner>>,
    buffer: VecDeque<RawRow>,
    last_row_key: Option<Vec<u8>>,
    rows_delivered: u64,
    resume_supported: bool,
    exhausted: bool,
    span: Span,
}

impl PartitionReader {
    pub fn new(
        partition: Partition,
        pool: Arc<ConnectionPool>,
        connection_config: ConnectionConfig,
        options: ReaderOptions,
    ) -> Self {
        let span = info_span!(
            "partition_scan",
            table = %partition.table(),
            partition = partition.index,
            start = %hex::encode(partition.range().start()),
            end = %hex::encode(partition.range().stop()),
        );
        Self {
            metrics: pool.metrics().clone(),
            partition,
            pool,
            connection_config,
            options,
            state: ReaderState::Created,
            connection: None,
            scanner: None,
            buffer: VecDeque::new(),
            last_row_key: None,
            rows_delivered: 0,
            resume_supported: false,
            exhausted: false,
            span,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Key of the last row handed to the caller.
    pub fn last_row_key(&self) -> Option<&[u8]> {
        self.last_row_key.as_deref()
    }

    /// Rows handed to the caller so far.
    pub fn rows_delivered(&self) -> u64 {
        self.rows_delivered
    }

    pub fn metrics(&self) -> &Arc<ScanMetrics> {
        &self.metrics
    }

    /// Borrows a connection, resolves the table and opens the cursor.
    pub async fn open(&mut self) -> Result<()> {
        let span = self.span.clone();
        self.open_inner().instrument(span).await
    }

    /// Next row of the partition, or `None` once the partition is exhausted or
    /// the reader is closed.
    pub async fn next(&mut self) -> Result<Option<RawRow>> {
        let span = self.span.clone();
        self.next_inner().instrument(span).await
    }

    /// Releases the cursor and connection. Safe to call repeatedly and after
    /// failures.
    pub async fn close(&mut self) {
        let span = self.span.clone();
        self.close_inner().instrument(span).await
    }

    /// Consumes the reader into a stream of rows, opening it first if needed.
    /// The reader is closed when the stream ends or yields an error.
    pub fn into_stream(self) -> impl Stream<Item = Result<RawRow>> + Send {
        stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            if reader.state == ReaderState::Created {
                if let Err(err) = reader.open().await {
                    reader.close().await;
                    return Some((Err(err), None));
                }
            }
            match reader.next().await {
                Ok(Some(row)) => Some((Ok(row), Some(reader))),
                Ok(None) => {
                    reader.close().await;
                    None
                }
                Err(err) => {
                    reader.close().await;
                    Some((Err(err), None))
                }
            }
        })
    }

    pub(crate) fn context(&self) -> ScanContext {
        ScanContext {
            table: self.partition.table().to_string(),
            start_key: self.partition.range().start().to_vec(),
            stop_key: self.partition.range().stop().to_vec(),
            last_row_key: self.last_row_key.clone(),
        }
    }

    async fn open_inner(&mut self) -> Result<()> {
        if self.state != ReaderState::Created {
            return Err(ScanError::InvalidState {
                expected: ReaderState::Created.as_str(),
                found: self.state.as_str(),
            });
        }
        if self.options.stop_requested() {
            return Err(self.cancel().await);
        }
        self.state = ReaderState::Opening;

        let (cancel, deadline) = (self.options.cancel.clone(), self.options.deadline);
        let outcome = until_stopped(cancel, deadline, self.open_with_retry()).await;
        match outcome {
            None => Err(self.cancel().await),
            Some(Err(err)) => Err(self.fail(err).await),
            Some(Ok(())) => {
                self.state = ReaderState::Streaming;
                self.metrics.record_scan_opened();
                info!(
                    owner = self.partition.owner_hint.as_deref().unwrap_or("unknown"),
                    "partition scan opened"
                );
                Ok(())
            }
        }
    }

    async fn next_inner(&mut self) -> Result<Option<RawRow>> {
        match self.state {
            ReaderState::Streaming => {}
            ReaderState::Closed => return Ok(None),
            state => {
                return Err(ScanError::InvalidState {
                    expected: ReaderState::Streaming.as_str(),
                    found: state.as_str(),
                })
            }
        }
        if self.options.stop_requested() {
            return Err(self.cancel().await);
        }

        loop {
            if let Some(row) = self.buffer.pop_front() {
                self.rows_delivered += 1;
                self.metrics.record_row_delivered(row.encoded_len());
                self.last_row_key = Some(row.row_key.clone());
                return Ok(Some(row));
            }
            if self.exhausted {
                return Ok(None);
            }

            let (cancel, deadline) = (self.options.cancel.clone(), self.options.deadline);
            let outcome = until_stopped(cancel, deadline, self.fetch_with_retry()).await;
            let batch = match outcome {
                None => return Err(self.cancel().await),
                Some(Err(err)) => return Err(self.fail(err).await),
                Some(Ok(batch)) => batch,
            };

            if batch.is_empty() {
                // Hand the connection back as soon as the cursor runs dry.
                self.exhausted = true;
                self.release_resources().await;
                debug!(rows = self.rows_delivered, "partition exhausted");
                continue;
            }

            let fetched = batch.len();
            self.buffer.extend(batch.into_iter().filter(|row| {
                self.last_row_key
                    .as_deref()
                    .map_or(true, |last| row.row_key.as_slice() > last)
            }));
            let duplicates = fetched - self.buffer.len();
            if duplicates > 0 {
                self.metrics.record_duplicates_skipped(duplicates);
                debug!(duplicates, "dropped rows at or before resume point");
            }
        }
    }

    async fn close_inner(&mut self) {
        match self.state {
            ReaderState::Closed => return,
            ReaderState::Errored => {
                self.release_resources().await;
                return;
            }
            _ => {}
        }

        let was_open = self.state == ReaderState::Streaming;
        self.release_resources().await;
        self.buffer.clear();
        self.state = ReaderState::Closed;
        if was_open {
            self.metrics.record_scan_closed();
        }
        info!(
            rows = self.rows_delivered,
            "closing partition (scanned {} rows)", self.rows_delivered
        );
    }

    async fn open_with_retry(&mut self) -> Result<()> {
        let mut attempt = 0usize;
        loop {
            match self.open_scan().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    self.drop_connection().await;
                    let delay = self.retry_delay(attempt, &err)?;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fetch_with_retry(&mut self) -> Result<Vec<RawRow>> {
        let mut attempt = 0usize;
        loop {
            match self.fetch_batch().await {
                Ok(batch) => {
                    if !batch.is_empty() {
                        self.metrics.record_batch();
                    }
                    return Ok(batch);
                }
                Err(err) if err.is_transient() => {
                    attempt += 1;
                    self.drop_connection().await;
                    let delay = self.retry_delay(attempt, &err)?;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Backoff before retry `attempt`, or the terminal error when the failure
    /// cannot be absorbed.
    fn retry_delay(&self, attempt: usize, err: &ScanError) -> Result<Duration> {
        if attempt > self.options.retry.max_attempts {
            return Err(ScanError::ScanInterrupted {
                context: self.context(),
                reason: format!(
                    "gave up after {} retries: {err}",
                    self.options.retry.max_attempts
                ),
            });
        }
        if self.last_row_key.is_some() && !self.resume_supported {
            return Err(ScanError::ScanInterrupted {
                context: self.context(),
                reason: format!("store cannot resume scans: {err}"),
            });
        }

        self.metrics.record_scan_retry();
        let delay = self.options.retry.backoff(attempt);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            last_row = %self.last_row_key.as_deref().map(hex::encode).unwrap_or_default(),
            error = %err,
            "transient scan failure, reopening"
        );
        Ok(delay)
    }

    async fn open_scan(&mut self) -> Result<()> {
        if self.connection.is_none() {
            // Transient connect failures come back as store errors so the
            // surrounding retry loop absorbs them.
            let connection = self
                .pool
                .acquire(&self.connection_config)
                .await
                .map_err(|err| err.with_context(self.context()))?;
            debug!(connection = connection.id(), "borrowed store connection");
            self.connection = Some(connection);
        }
        let Some(session) = self.connection.as_ref().map(|c| c.session().clone()) else {
            return Err(ScanError::InvalidState {
                expected: "borrowed connection",
                found: self.state.as_str(),
            });
        };

        let table = self.partition.table().to_string();
        session
            .resolve_table(&table)
            .await
            .map_err(|err| ScanError::from_store(self.context(), err))?;

        self.resume_supported = session.supports_resume();
        let resume_after = self.last_row_key.clone();
        if let Some(key) = &resume_after {
            if !self.resume_supported {
                return Err(ScanError::ScanInterrupted {
                    context: self.context(),
                    reason: "store cannot resume scans".to_string(),
                });
            }
            self.metrics.record_scan_resume();
            info!(resume_after = %hex::encode(key), "resuming partition scan");
        }

        let scanner = session
            .open_scanner(&self.partition.spec, resume_after.as_deref())
            .await
            .map_err(|err| ScanError::from_store(self.context(), err))?;
        self.scanner = Some(scanner);
        Ok(())
    }

    async fn fetch_batch(&mut self) -> Result<Vec<RawRow>> {
        if self.scanner.is_none() {
            self.open_scan().await?;
        }
        let (max_rows, max_cells) = (
            self.partition.spec.cache_size(),
            self.partition.spec.batch_size(),
        );
        let Some(scanner) = self.scanner.as_mut() else {
            return Err(ScanError::InvalidState {
                expected: "open scanner",
                found: self.state.as_str(),
            });
        };
        let fetched = scanner.next_batch(max_rows, max_cells).await;
        fetched.map_err(|err| ScanError::from_store(self.context(), err))
    }

    /// Drops the cursor and discards the connection after a transport failure.
    async fn drop_connection(&mut self) {
        if let Some(mut scanner) = self.scanner.take() {
            scanner.close().await;
        }
        if let Some(connection) = self.connection.take() {
            connection.discard().await;
        }
    }

    async fn release_resources(&mut self) {
        if let Some(mut scanner) = self.scanner.take() {
            scanner.close().await;
        }
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }

    async fn cancel(&mut self) -> ScanError {
        self.metrics.record_scan_cancelled();
        self.release_resources().await;
        self.buffer.clear();
        self.state = ReaderState::Closed;
        info!(
            rows = self.rows_delivered,
            deadline = self.options.deadline.is_some() && !self.options.cancel.is_cancelled(),
            "partition scan cancelled"
        );
        ScanError::Cancelled {
            context: self.context(),
        }
    }

    async fn fail(&mut self, err: ScanError) -> ScanError {
        // A session that just failed is not handed to the next borrower.
        if matches!(err, ScanError::Store { .. }) {
            self.drop_connection().await;
        } else {
            self.release_resources().await;
        }
        self.buffer.clear();
        self.state = ReaderState::Errored;
        warn!(rows = self.rows_delivered, error = %err, "partition scan failed");
        err
    }
}

impl fmt::Debug for PartitionReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionReader")
            .field("partition", &self.partition)
            .field("state", &self.state)
            .field("rows_delivered", &self.rows_delivered)
            .finish()
    }
}

/// Runs `fut` unless the token fires or the deadline passes first.
async fn until_stopped<F: Future>(
    cancel: CancellationToken,
    deadline: Option<Instant>,
    fut: F,
) -> Option<F::Output> {
    let deadline_reached = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        _ = deadline_reached => None,
        output = fut => Some(output),
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::config::PoolOptions;
    use crate::memory::MemoryStore;
    use crate::row::Cell;
    use crate::spec::{KeyRange, ScanSpec};
    use crate::topology::regions_from_splits;

    const TABLE: &str = "orders";

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_table(
                TABLE,
                regions_from_splits(&[b"f".to_vec(), b"m".to_vec(), b"t".to_vec()], &[])
                    .expect("regions"),
            )
            .expect("table");
        store
            .load_rows(
                TABLE,
                (1..=9).map(|i| RawRow::new(format!("p{i}"), vec![Cell::new("d", "n", 1, i.to_string())])),
            )
            .expect("rows");
        store
    }

    fn partition(start: &str, stop: &str, cache_size: usize) -> Partition {
        Partition {
            index: 0,
            spec: ScanSpec::builder(TABLE)
                .range(KeyRange::new(start.as_bytes(), stop.as_bytes()).expect("range"))
                .cache_size(cache_size)
                .build()
                .expect("spec"),
            owner_hint: None,
            region_id: 3,
        }
    }

    fn fast_retry(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
        }
    }

    fn reader(store: &MemoryStore, partition: Partition, options: ReaderOptions) -> PartitionReader {
        let pool = ConnectionPool::new(Arc::new(store.clone()), PoolOptions::default());
        PartitionReader::new(partition, pool, ConnectionConfig::new("memory://test"), options)
    }

    async fn drain(reader: &mut PartitionReader) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        while let Some(row) = reader.next().await? {
            keys.push(String::from_utf8_lossy(&row.row_key).into_owned());
        }
        Ok(keys)
    }

    fn expected(range: std::ops::RangeInclusive<u32>) -> Vec<String> {
        range.map(|i| format!("p{i}")).collect()
    }

    #[tokio::test]
    async fn empty_partition_yields_nothing_and_stays_exhausted() {
        let store = seeded_store();
        let mut reader = reader(&store, partition("a", "c", 10), ReaderOptions::default());
        reader.open().await.expect("open");
        assert!(reader.next().await.expect("next").is_none());
        assert!(reader.next().await.expect("next again").is_none());
        reader.close().await;
        assert_eq!(reader.state(), ReaderState::Closed);
        assert_eq!(reader.rows_delivered(), 0);
    }

    #[tokio::test]
    async fn resumes_strictly_after_last_delivered_row() {
        let store = seeded_store();
        store.fail_after_row(TABLE, b"p5".to_vec(), 1);
        let mut reader = reader(
            &store,
            partition("m", "t", 3),
            ReaderOptions::default().with_retry(fast_retry(3)),
        );
        reader.open().await.expect("open");

        assert_eq!(drain(&mut reader).await.expect("drain"), expected(1..=9));
        let metrics = reader.metrics.snapshot();
        assert_eq!(metrics.scan_retries, 1);
        assert_eq!(metrics.scan_resumes, 1);
        assert_eq!(metrics.rows_delivered, 9);
        assert_eq!(store.scans_opened(), 2);
        reader.close().await;
    }

    #[tokio::test]
    async fn missing_resume_support_surfaces_interruption_with_last_key() {
        let store = seeded_store();
        store.set_resume_supported(false);
        store.fail_after_row(TABLE, b"p5".to_vec(), 1);
        let mut reader = reader(
            &store,
            partition("m", "t", 3),
            ReaderOptions::default().with_retry(fast_retry(3)),
        );
        reader.open().await.expect("open");

        let err = drain(&mut reader).await.expect_err("interrupted");
        assert!(matches!(err, ScanError::ScanInterrupted { .. }));
        assert_eq!(err.last_row_key(), Some(&b"p5"[..]));
        assert!(err.is_retryable_by_caller());
        assert_eq!(reader.state(), ReaderState::Errored);

        reader.close().await;
        reader.close().await;
        assert!(matches!(
            reader.next().await,
            Err(ScanError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_interruption() {
        let store = seeded_store();
        store.fail_next_fetches(TABLE, 10);
        let mut reader = reader(
            &store,
            partition("m", "t", 3),
            ReaderOptions::default().with_retry(fast_retry(2)),
        );
        reader.open().await.expect("open");

        let err = reader.next().await.expect_err("retries exhausted");
        assert!(matches!(err, ScanError::ScanInterrupted { .. }));
        assert_eq!(err.last_row_key(), None);
        assert_eq!(reader.metrics.snapshot().scan_retries, 2);
    }

    #[tokio::test]
    async fn unknown_table_is_not_retried() {
        let store = MemoryStore::new();
        let mut reader = reader(
            &store,
            partition("m", "t", 3),
            ReaderOptions::default().with_retry(fast_retry(5)),
        );
        let err = reader.open().await.expect_err("missing table");
        assert!(matches!(err, ScanError::TableNotFound { .. }));
        assert_eq!(reader.state(), ReaderState::Errored);
        assert_eq!(reader.metrics.snapshot().scan_retries, 0);
        assert_eq!(reader.pool.stats().outstanding, 0);
    }

    #[tokio::test]
    async fn cancellation_closes_reader_and_releases_connection() {
        let store = seeded_store();
        let cancel = CancellationToken::new();
        let mut reader = reader(
            &store,
            partition("m", "t", 2),
            ReaderOptions::default().with_cancel(cancel.clone()),
        );
        reader.open().await.expect("open");
        assert!(reader.next().await.expect("first").is_some());

        cancel.cancel();
        let err = reader.next().await.expect_err("cancelled");
        assert!(matches!(err, ScanError::Cancelled { .. }));
        assert_eq!(err.last_row_key(), Some(&b"p1"[..]));
        assert_eq!(reader.state(), ReaderState::Closed);
        assert_eq!(reader.pool.stats().outstanding, 0);
        assert!(reader.next().await.expect("closed").is_none());
    }

    #[tokio::test]
    async fn transient_reconnect_failure_is_retried_and_resumes() {
        let store = seeded_store();
        store.fail_after_row(TABLE, b"p5".to_vec(), 1);
        let mut reader = reader(
            &store,
            partition("m", "t", 3),
            ReaderOptions::default().with_retry(fast_retry(3)),
        );
        reader.open().await.expect("open");
        // The first reconnect after the fault is refused.
        store.fail_connects(1);

        assert_eq!(drain(&mut reader).await.expect("drain"), expected(1..=9));
        let metrics = reader.metrics.snapshot();
        assert_eq!(metrics.scan_retries, 2);
        assert_eq!(metrics.scan_resumes, 1);
        assert_eq!(store.connect_count(), 2);
        reader.close().await;
    }

    #[tokio::test]
    async fn pool_shutdown_mid_stream_reports_last_row() {
        let store = seeded_store();
        store.fail_after_row(TABLE, b"p3".to_vec(), 1);
        let pool = ConnectionPool::new(
            Arc::new(store.clone()),
            PoolOptions {
                max_connections_per_key: 1,
                acquire_timeout: Duration::from_millis(50),
                drain_timeout: Duration::from_millis(10),
            },
        );
        let mut reader = PartitionReader::new(
            partition("m", "t", 3),
            pool.clone(),
            ConnectionConfig::new("memory://test"),
            ReaderOptions::default().with_retry(fast_retry(3)),
        );
        reader.open().await.expect("open");
        for _ in 0..3 {
            assert!(reader.next().await.expect("row").is_some());
        }
        assert_eq!(pool.shutdown().await.abandoned, 1);

        let err = reader.next().await.expect_err("pool is gone");
        assert!(matches!(err, ScanError::ConnectionUnavailable { .. }));
        assert_eq!(err.last_row_key(), Some(&b"p3"[..]));
        assert_eq!(reader.state(), ReaderState::Errored);
    }

    #[tokio::test]
    async fn fatal_store_error_discards_the_session() {
        let store = seeded_store();
        let mut reader = reader(
            &store,
            partition("m", "t", 3),
            ReaderOptions::default().with_retry(fast_retry(3)),
        );
        reader.open().await.expect("open");
        store.fail_next_fetches_fatally(TABLE, 1);

        let err = reader.next().await.expect_err("fatal fetch");
        assert!(matches!(err, ScanError::Store { .. }));
        assert_eq!(reader.state(), ReaderState::Errored);
        let metrics = reader.metrics.snapshot();
        assert_eq!(metrics.scan_retries, 0);
        assert_eq!(metrics.connections_discarded, 1);
        assert_eq!(store.sessions_closed(), 1);
        let stats = reader.pool.stats();
        assert_eq!((stats.idle, stats.outstanding), (0, 0));
    }

    #[tokio::test]
    async fn cancelling_a_pending_fetch_closes_the_reader() {
        let store = seeded_store();
        let cancel = CancellationToken::new();
        let mut reader = reader(
            &store,
            partition("m", "t", 2),
            ReaderOptions::default().with_cancel(cancel.clone()),
        );
        reader.open().await.expect("open");
        assert!(reader.next().await.expect("p1").is_some());
        assert!(reader.next().await.expect("p2").is_some());
        store.stall_fetches(TABLE);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = reader.next().await.expect_err("cancelled while fetching");
        canceller.await.expect("canceller");

        assert!(matches!(err, ScanError::Cancelled { .. }));
        assert_eq!(err.last_row_key(), Some(&b"p2"[..]));
        assert_eq!(reader.state(), ReaderState::Closed);
        assert_eq!(reader.rows_delivered(), 2);
        assert_eq!(reader.pool.stats().outstanding, 0);
        assert_eq!(reader.metrics.snapshot().scans_cancelled, 1);
    }

    #[tokio::test]
    async fn deadline_interrupts_a_pending_fetch() {
        let store = seeded_store();
        let mut reader = reader(
            &store,
            partition("m", "t", 2),
            ReaderOptions::default().with_timeout(Duration::from_millis(200)),
        );
        reader.open().await.expect("open");
        assert!(reader.next().await.expect("p1").is_some());
        store.stall_fetches(TABLE);
        assert!(reader.next().await.expect("p2 from buffer").is_some());

        let err = reader.next().await.expect_err("deadline while fetching");
        assert!(matches!(err, ScanError::Cancelled { .. }));
        assert_eq!(err.last_row_key(), Some(&b"p2"[..]));
        assert_eq!(reader.state(), ReaderState::Closed);
        assert_eq!(reader.pool.stats().outstanding, 0);
    }

    #[tokio::test]
    async fn elapsed_deadline_cancels_the_scan() {
        let store = seeded_store();
        let mut reader = reader(
            &store,
            partition("m", "t", 2),
            ReaderOptions::default().with_deadline(Instant::now()),
        );
        let err = reader.open().await.expect_err("deadline");
        assert!(matches!(err, ScanError::Cancelled { .. }));
        assert_eq!(reader.metrics.snapshot().scans_cancelled, 1);
    }

    #[tokio::test]
    async fn lifecycle_misuse_is_rejected() {
        let store = seeded_store();
        let mut reader = reader(&store, partition("m", "t", 2), ReaderOptions::default());
        assert!(matches!(
            reader.next().await,
            Err(ScanError::InvalidState { found: "created", .. })
        ));
        reader.open().await.expect("open");
        assert!(reader.open().await.is_err());
        reader.close().await;
        reader.close().await;
        assert_eq!(reader.metrics.snapshot().scans_closed, 1);
    }

    #[tokio::test]
    async fn stream_adapter_opens_and_closes() {
        let store = seeded_store();
        let reader = reader(&store, partition("p3", "p6", 2), ReaderOptions::default());
        let pool = reader.pool.clone();
        let rows = reader
            .into_stream()
            .map(|row| row.map(|row| row.row_key))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .expect("rows");
        assert_eq!(rows, vec![b"p3".to_vec(), b"p4".to_vec(), b"p5".to_vec()]);
        assert_eq!(pool.stats().outstanding, 0);
        assert_eq!(pool.metrics().snapshot().scans_closed, 1);
    }
}
