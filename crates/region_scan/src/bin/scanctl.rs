//! Command-line driver for planning and reading partitioned table scans.
//!
//! The store is described by a JSON layout file (see `StoreLayout`); scan
//! sizing, retry and pool limits come from `REGION_SCAN_*` environment
//! variables.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::stream::{self, StreamExt};
use region_scan::memory::decode_text;
use region_scan::{
    ColumnMapping, ColumnMappingCodec, ConnectionPool, DecodePolicy, Encoding, KeyRange,
    MemoryStore, RawJsonCodec, RowCodec, ScanConfig, StoreConnector, StoreLayout, TableSource,
    TypedRecord,
};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scanctl")]
#[command(about = "Plan and read partitioned scans over a region-sharded table", long_about = None)]
struct Cli {
    /// JSON store layout describing tables, region splits and rows.
    #[arg(long)]
    layout: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the partitions a scan would be split into.
    Plan(RangeArgs),
    /// Read every partition concurrently and print records as JSON lines.
    Read {
        #[command(flatten)]
        range: RangeArgs,
        /// Typed column mappings, `family:qualifier[:type][?]`, comma separated.
        /// Without mappings every selected cell is printed as text.
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,
        /// Decode mapped numeric columns from decimal text instead of big-endian bytes.
        #[arg(long, default_value_t = false)]
        text_values: bool,
        /// Log and skip rows that fail to decode instead of aborting.
        #[arg(long, default_value_t = false)]
        skip_bad_rows: bool,
        /// Maximum partitions read at the same time.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        /// Abort the whole read after this many milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Args)]
struct RangeArgs {
    #[arg(long)]
    table: String,
    /// Inclusive start key; prefix with `hex:` for raw bytes.
    #[arg(long)]
    start: Option<String>,
    /// Exclusive stop key; prefix with `hex:` for raw bytes.
    #[arg(long)]
    stop: Option<String>,
    #[arg(long, default_value_t = 4)]
    parallelism: usize,
}

impl RangeArgs {
    fn key_range(&self) -> Result<KeyRange> {
        let start = self.start.as_deref().map(decode_text).transpose()?;
        let stop = self.stop.as_deref().map(decode_text).transpose()?;
        KeyRange::from_options(start, stop).context("invalid key range")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("region_scan=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = ScanConfig::from_env()?;
    let layout = StoreLayout::from_path(&cli.layout)?;
    let store: Arc<dyn StoreConnector> = Arc::new(MemoryStore::from_layout(&layout)?);
    let pool = ConnectionPool::shared(store, config.pool);

    let outcome = match cli.command {
        Command::Plan(range) => plan(pool, &config, &range).await,
        Command::Read {
            range,
            columns,
            text_values,
            skip_bad_rows,
            concurrency,
            timeout_ms,
        } => {
            let policy = if skip_bad_rows {
                DecodePolicy::SkipAndLog
            } else {
                DecodePolicy::Abort
            };
            let options = ReadOptions {
                policy,
                concurrency: concurrency.max(1),
                timeout: timeout_ms.map(Duration::from_millis),
            };
            if columns.is_empty() {
                read(pool, &config, &range, RawJsonCodec, options, Value::clone).await
            } else {
                let mappings = columns
                    .iter()
                    .map(|raw| {
                        raw.parse::<ColumnMapping>()
                            .with_context(|| format!("invalid --columns entry: {raw}"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let mut codec = ColumnMappingCodec::new(mappings);
                if text_values {
                    codec = codec.with_encoding(Encoding::Text);
                }
                // Only fetch the mapped columns.
                let mut config = config.clone();
                config
                    .template
                    .column_filters
                    .extend(codec.column_selectors());
                read(pool, &config, &range, codec, options, TypedRecord::to_json).await
            }
        }
    };

    if let Some(report) = ConnectionPool::shutdown_shared().await {
        info!(
            closed_idle = report.closed_idle,
            abandoned = report.abandoned,
            "released store connections"
        );
    }
    outcome
}

async fn plan(pool: Arc<ConnectionPool>, config: &ScanConfig, args: &RangeArgs) -> Result<()> {
    let source = TableSource::from_config(pool, config, RawJsonCodec).build();
    let partitions = source
        .list_partitions(&args.table, &args.key_range()?, args.parallelism)
        .await
        .with_context(|| format!("plan scan of table {}", args.table))?;
    for partition in &partitions {
        println!(
            "{}",
            json!({
                "index": partition.index,
                "region": partition.region_id,
                "start": render_key(partition.range().start()),
                "stop": render_key(partition.range().stop()),
                "owner": partition.owner_hint,
            })
        );
    }
    Ok(())
}

struct ReadOptions {
    policy: DecodePolicy,
    concurrency: usize,
    timeout: Option<Duration>,
}

async fn read<C: RowCodec>(
    pool: Arc<ConnectionPool>,
    config: &ScanConfig,
    args: &RangeArgs,
    codec: C,
    options: ReadOptions,
    render: fn(&C::Record) -> Value,
) -> Result<()> {
    let mut builder = TableSource::from_config(pool.clone(), config, codec).decode_policy(options.policy);
    if let Some(timeout) = options.timeout {
        builder = builder.timeout(timeout);
    }
    let source = builder.build();

    let partitions = source
        .list_partitions(&args.table, &args.key_range()?, args.parallelism)
        .await
        .with_context(|| format!("plan scan of table {}", args.table))?;
    let source = &source;

    let results = stream::iter(partitions)
        .map(|partition| async move {
            let index = partition.index;
            let mut reader = source.read_partition(partition);
            let mut records = Vec::new();
            let outcome = loop {
                match reader.next().await {
                    Ok(Some(record)) => records.push(render(&record)),
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(err),
                }
            };
            reader.close().await;
            (index, outcome.map(|()| (records, reader.skipped_rows())))
        })
        .buffer_unordered(options.concurrency)
        .collect::<Vec<_>>()
        .await;

    let mut ordered = BTreeMap::new();
    for (index, outcome) in results {
        let (records, skipped) =
            outcome.with_context(|| format!("read partition {index} of table {}", args.table))?;
        ordered.insert(index, (records, skipped));
    }

    let mut skipped_total = 0;
    for (records, skipped) in ordered.into_values() {
        skipped_total += skipped;
        for record in records {
            println!("{record}");
        }
    }

    let metrics = pool.metrics().snapshot();
    info!(
        table = %args.table,
        rows = metrics.rows_delivered,
        skipped = skipped_total,
        retries = metrics.scan_retries,
        resumes = metrics.scan_resumes,
        "scan complete"
    );
    Ok(())
}

fn render_key(key: &[u8]) -> Value {
    if key.is_empty() {
        Value::Null
    } else {
        match std::str::from_utf8(key) {
            Ok(text) => json!(text),
            Err(_) => json!(format!("hex:{}", hex::encode(key))),
        }
    }
}
