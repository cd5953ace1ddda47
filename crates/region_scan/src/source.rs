//! Consumer-facing read interface.
//!
//! [`TableSource`] ties the pieces together: it plans partitions through a
//! pooled session and turns each partition into a [`RecordReader`] that runs a
//! [`PartitionReader`] and decodes rows with the injected codec.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::codec::{DecodePolicy, RowCodec};
use crate::config::{ConnectionConfig, RetryPolicy, ScanConfig};
use crate::error::{Result, ScanContext, ScanError};
use crate::planner::{Partition, RegionFilter, SplitPlanner};
use crate::pool::ConnectionPool;
use crate::reader::{PartitionReader, ReaderOptions, ReaderState};
use crate::spec::{KeyRange, ScanTemplate};

/// Entry point for consumers: plans partitions of a table and hands out
/// decoding readers for them.
pub struct TableSource<C: RowCodec> {
    pool: Arc<ConnectionPool>,
    connection: ConnectionConfig,
    codec: Arc<C>,
    planner: SplitPlanner,
    policy: DecodePolicy,
    options: ReaderOptions,
}

impl<C: RowCodec> TableSource<C> {
    pub fn builder(
        pool: Arc<ConnectionPool>,
        connection: ConnectionConfig,
        codec: C,
    ) -> TableSourceBuilder<C> {
        TableSourceBuilder {
            pool,
            connection,
            codec,
            template: ScanTemplate::default(),
            filter: None,
            policy: DecodePolicy::default(),
            options: ReaderOptions::default(),
        }
    }

    /// Builder preloaded with the connection, template and retry settings of
    /// `config`.
    pub fn from_config(
        pool: Arc<ConnectionPool>,
        config: &ScanConfig,
        codec: C,
    ) -> TableSourceBuilder<C> {
        Self::builder(pool, config.connection.clone(), codec)
            .template(config.template.clone())
            .retry(config.retry)
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Splits the scan of `table` over `range` into region-aligned partitions.
    pub async fn list_partitions(
        &self,
        table: &str,
        range: &KeyRange,
        target_parallelism: usize,
    ) -> Result<Vec<Partition>> {
        let connection = self.pool.acquire(&self.connection).await.map_err(|err| {
            err.with_context(ScanContext {
                table: table.to_string(),
                start_key: range.start().to_vec(),
                stop_key: range.stop().to_vec(),
                last_row_key: None,
            })
        })?;
        let planned = self
            .planner
            .plan(connection.session().as_ref(), table, range, target_parallelism)
            .await;
        self.pool.release(connection);
        planned
    }

    /// Creates an unopened reader for `partition`; it opens on first `next`.
    pub fn read_partition(&self, partition: Partition) -> RecordReader<C> {
        RecordReader {
            reader: PartitionReader::new(
                partition,
                self.pool.clone(),
                self.connection.clone(),
                self.options.clone(),
            ),
            codec: self.codec.clone(),
            policy: self.policy,
            skipped_rows: 0,
            last_decoded_key: None,
            aborted: false,
        }
    }
}

impl<C: RowCodec> fmt::Debug for TableSource<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableSource")
            .field("connection", &self.connection)
            .field("planner", &self.planner)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Configures a [`TableSource`]; obtained from [`TableSource::builder`].
pub struct TableSourceBuilder<C: RowCodec> {
    pool: Arc<ConnectionPool>,
    connection: ConnectionConfig,
    codec: C,
    template: ScanTemplate,
    filter: Option<Arc<dyn RegionFilter>>,
    policy: DecodePolicy,
    options: ReaderOptions,
}

impl<C: RowCodec> TableSourceBuilder<C> {
    pub fn template(mut self, template: ScanTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn region_filter(mut self, filter: Arc<dyn RegionFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn decode_policy(mut self, policy: DecodePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.options.retry = retry;
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.options.cancel = cancel;
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.options.deadline = Some(deadline);
        self
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(Instant::now() + timeout)
    }

    pub fn build(self) -> TableSource<C> {
        let mut planner =
            SplitPlanner::new(self.template).with_metrics(self.pool.metrics().clone());
        if let Some(filter) = self.filter {
            planner = planner.with_filter(filter);
        }
        TableSource {
            pool: self.pool,
            connection: self.connection,
            codec: Arc::new(self.codec),
            planner,
            policy: self.policy,
            options: self.options,
        }
    }
}

/// Decoded view over one partition.
pub struct RecordReader<C: RowCodec> {
    reader: PartitionReader,
    codec: Arc<C>,
    policy: DecodePolicy,
    skipped_rows: u64,
    last_decoded_key: Option<Vec<u8>>,
    aborted: bool,
}

impl<C: RowCodec> RecordReader<C> {
    pub fn partition(&self) -> &Partition {
        self.reader.partition()
    }

    pub fn state(&self) -> ReaderState {
        if self.aborted {
            ReaderState::Errored
        } else {
            self.reader.state()
        }
    }

    /// Rows dropped under [`DecodePolicy::SkipAndLog`].
    pub fn skipped_rows(&self) -> u64 {
        self.skipped_rows
    }

    /// Key of the last row that decoded successfully.
    pub fn last_row_key(&self) -> Option<&[u8]> {
        self.last_decoded_key.as_deref()
    }

    pub async fn open(&mut self) -> Result<()> {
        self.reader.open().await
    }

    pub async fn next(&mut self) -> Result<Option<C::Record>> {
        if self.aborted {
            return Err(ScanError::InvalidState {
                expected: ReaderState::Streaming.as_str(),
                found: ReaderState::Errored.as_str(),
            });
        }
        if self.reader.state() == ReaderState::Created {
            self.reader.open().await?;
        }

        loop {
            let Some(row) = self.reader.next().await? else {
                return Ok(None);
            };
            match self.codec.decode(&row) {
                Ok(record) => {
                    self.last_decoded_key = Some(row.row_key);
                    return Ok(Some(record));
                }
                Err(source) => {
                    self.reader.metrics().record_decode_failure();
                    match self.policy {
                        DecodePolicy::SkipAndLog => {
                            self.skipped_rows += 1;
                            self.reader.metrics().record_row_skipped();
                            warn!(
                                table = %self.partition().table(),
                                row = %hex::encode(&row.row_key),
                                error = %source,
                                "skipping row that failed to decode"
                            );
                        }
                        DecodePolicy::Abort => {
                            let mut context = self.reader.context();
                            context.last_row_key = self.last_decoded_key.clone();
                            self.reader.close().await;
                            self.aborted = true;
                            return Err(ScanError::Decode { context, source });
                        }
                    }
                }
            }
        }
    }

    pub async fn close(&mut self) {
        self.reader.close().await;
    }

    /// Consumes the reader into a stream of records; the stream ends after the
    /// first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<C::Record>> + Send {
        stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            match reader.next().await {
                Ok(Some(record)) => Some((Ok(record), Some(reader))),
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
}

impl<C: RowCodec> fmt::Debug for RecordReader<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordReader")
            .field("reader", &self.reader)
            .field("policy", &self.policy)
            .field("skipped_rows", &self.skipped_rows)
            .finish()
    }
}
