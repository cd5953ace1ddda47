//! End-to-end scans: planning, concurrent partition reads, resume after
//! transient failures, pool pressure, decode policies and layout loading.

mod common;

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use common::{connection, fast_retry, order_codec, order_keys, orders_store, pool, ORDERS};
use futures_util::future::join_all;
use futures_util::StreamExt;
use region_scan::{
    ConnectionPool, DecodePolicy, FieldValue, KeyRange, MemoryStore, PoolOptions, RawJsonCodec,
    RowCodec, ScanError, ScanTemplate, StoreLayout, TableSource, TypedRecord,
};
use tokio_util::sync::CancellationToken;

fn key_range(start: &str, stop: &str) -> KeyRange {
    KeyRange::new(start.as_bytes(), stop.as_bytes()).expect("range")
}

async fn read_concurrently<C: RowCodec>(
    source: Arc<TableSource<C>>,
    range: &KeyRange,
) -> Vec<Result<Vec<C::Record>, ScanError>> {
    let partitions = source
        .list_partitions(ORDERS, range, 4)
        .await
        .expect("plan");
    let tasks = partitions.into_iter().map(|partition| {
        let source = source.clone();
        tokio::spawn(async move {
            source
                .read_partition(partition)
                .into_stream()
                .collect::<Vec<_>>()
                .await
                .into_iter()
                .collect::<Result<Vec<_>, _>>()
        })
    });
    join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("reader task"))
        .collect()
}

fn row_keys(records: &[TypedRecord]) -> Vec<String> {
    records
        .iter()
        .map(|record| String::from_utf8_lossy(&record.row_key).into_owned())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_partitions_deliver_every_row_once_despite_failures() {
    let store = orders_store();
    store.fail_after_row(ORDERS, b"p5".to_vec(), 1);
    store.fail_after_row(ORDERS, b"c1".to_vec(), 1);
    let pool = pool(&store, 4);
    let source = Arc::new(
        TableSource::builder(pool.clone(), connection(), order_codec())
            .template(ScanTemplate {
                cache_size: 2,
                ..ScanTemplate::default()
            })
            .retry(fast_retry())
            .build(),
    );

    let results = read_concurrently(source, &key_range("c", "t")).await;
    assert_eq!(results.len(), 3);
    let mut keys = Vec::new();
    for result in results {
        keys.extend(row_keys(&result.expect("partition read")));
    }

    let expected = order_keys()
        .into_iter()
        .filter(|key| key.as_str() < "t")
        .collect::<Vec<_>>();
    assert_eq!(keys, expected);

    let metrics = pool.metrics().snapshot();
    assert_eq!(metrics.scan_resumes, 2);
    assert_eq!(metrics.rows_delivered, expected.len() as u64);
    assert_eq!(pool.stats().outstanding, 0);
}

#[tokio::test]
async fn typed_records_carry_decoded_fields() {
    let store = orders_store();
    let pool = pool(&store, 2);
    let source = TableSource::builder(pool, connection(), order_codec()).build();
    let partitions = source
        .list_partitions(ORDERS, &key_range("g", "h"), 1)
        .await
        .expect("plan");
    assert_eq!(partitions.len(), 1);
    assert_eq!(partitions[0].owner_hint.as_deref(), Some("rs2:16020"));

    let mut reader = source.read_partition(partitions[0].clone());
    let record = reader.next().await.expect("next").expect("one record");
    assert_eq!(record.row_key, b"g1".to_vec());
    assert_eq!(record.get("customer"), Some(&FieldValue::Utf8("customer-2".to_string())));
    assert_eq!(record.get("total_cents"), Some(&FieldValue::Int64(200)));
    assert!(reader.next().await.expect("end").is_none());
    reader.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_share_a_small_pool_without_timeouts() {
    let store = orders_store();
    let pool = pool(&store, 1);
    let source = Arc::new(
        TableSource::builder(pool.clone(), connection(), RawJsonCodec)
            .template(ScanTemplate {
                cache_size: 1,
                ..ScanTemplate::default()
            })
            .build(),
    );

    let results = read_concurrently(source, &KeyRange::full()).await;
    let total = results
        .into_iter()
        .map(|result| result.expect("partition read").len())
        .sum::<usize>();
    assert_eq!(total, order_keys().len());

    let metrics = pool.metrics().snapshot();
    assert_eq!(metrics.connections_opened, 1);
    assert_eq!(metrics.pool_timeouts, 0);
}

#[tokio::test]
async fn pool_saturation_surfaces_connection_unavailable() {
    let store = orders_store();
    let pool = ConnectionPool::new(
        Arc::new(store.clone()),
        PoolOptions {
            max_connections_per_key: 1,
            acquire_timeout: Duration::from_millis(20),
            drain_timeout: Duration::from_millis(100),
        },
    );
    let source = TableSource::builder(pool.clone(), connection(), RawJsonCodec).build();
    let partitions = source
        .list_partitions(ORDERS, &KeyRange::full(), 1)
        .await
        .expect("plan");

    let held = pool.acquire(&connection()).await.expect("held connection");
    let mut reader = source.read_partition(partitions[0].clone());
    let err = reader.next().await.expect_err("pool exhausted");
    assert!(matches!(err, ScanError::ConnectionUnavailable { .. }));
    assert!(err.is_retryable_by_caller());

    pool.release(held);
    let mut retry = source.read_partition(partitions[0].clone());
    assert!(retry.next().await.expect("after release").is_some());
    retry.close().await;
}

#[tokio::test]
async fn skip_policy_drops_rows_missing_required_columns() {
    let store = orders_store();
    store
        .load_rows(
            ORDERS,
            [region_scan::RawRow::new(
                "h1",
                vec![region_scan::Cell::new("d", "customer", 1, "no-total")],
            )],
        )
        .expect("bad row");
    let pool = pool(&store, 2);
    let source = TableSource::builder(pool.clone(), connection(), order_codec())
        .decode_policy(DecodePolicy::SkipAndLog)
        .build();
    let partition = source
        .list_partitions(ORDERS, &key_range("f", "m"), 1)
        .await
        .expect("plan")
        .remove(0);

    let mut reader = source.read_partition(partition);
    let mut keys = Vec::new();
    while let Some(record) = reader.next().await.expect("next") {
        keys.push(record.row_key);
    }
    reader.close().await;
    assert_eq!(keys, vec![b"g1".to_vec()]);
    assert_eq!(reader.skipped_rows(), 1);
    assert_eq!(pool.metrics().snapshot().rows_skipped, 1);
}

#[tokio::test]
async fn cancelled_token_stops_every_partition() {
    let store = orders_store();
    let cancel = CancellationToken::new();
    let source = TableSource::builder(pool(&store, 2), connection(), RawJsonCodec)
        .cancel_token(cancel.clone())
        .build();
    let partitions = source
        .list_partitions(ORDERS, &KeyRange::full(), 4)
        .await
        .expect("plan");
    cancel.cancel();

    for partition in partitions {
        let mut reader = source.read_partition(partition);
        let err = reader.next().await.expect_err("cancelled");
        assert!(matches!(err, ScanError::Cancelled { .. }));
        reader.close().await;
    }
    assert_eq!(source.pool().stats().outstanding, 0);
}

#[tokio::test]
async fn missing_table_is_reported_by_planning() {
    let store = MemoryStore::new();
    let source = TableSource::builder(pool(&store, 1), connection(), RawJsonCodec).build();
    let err = source
        .list_partitions("absent", &KeyRange::full(), 1)
        .await
        .expect_err("unknown table");
    assert!(matches!(err, ScanError::TableNotFound { .. }));
    assert!(!err.is_retryable_by_caller());
}

#[tokio::test]
async fn layout_file_drives_plan_and_read() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(
        file,
        r#"{{
            "tables": [{{
                "name": "events",
                "splits": ["k"],
                "owners": ["rs1"],
                "rows": [
                    {{"key": "a", "cells": [{{"family": "e", "qualifier": "kind", "value": "open"}}]}},
                    {{"key": "m", "cells": [{{"family": "e", "qualifier": "kind", "value": "close"}}]}}
                ]
            }}]
        }}"#
    )
    .expect("write layout");

    let layout = StoreLayout::from_path(file.path()).expect("layout");
    let store = MemoryStore::from_layout(&layout).expect("store");
    let source = TableSource::builder(pool(&store, 1), connection(), RawJsonCodec).build();
    let partitions = source
        .list_partitions("events", &KeyRange::full(), 2)
        .await
        .expect("plan");
    assert_eq!(partitions.len(), 2);

    let mut kinds = BTreeSet::new();
    for partition in partitions {
        let mut reader = source.read_partition(partition);
        while let Some(record) = reader.next().await.expect("next") {
            kinds.insert(record["e:kind"].as_str().unwrap_or_default().to_string());
        }
        reader.close().await;
    }
    assert_eq!(
        kinds,
        ["close", "open"]
            .into_iter()
            .map(String::from)
            .collect::<BTreeSet<_>>()
    );
}
