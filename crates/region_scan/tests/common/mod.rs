//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use region_scan::topology::regions_from_splits;
use region_scan::{
    Cell, ColumnMapping, ColumnMappingCodec, ConnectionConfig, ConnectionPool, MemoryStore,
    PoolOptions, RawRow, RetryPolicy, ValueKind,
};

pub const ORDERS: &str = "orders";

/// Keys of every row seeded by [`orders_store`], in key order.
pub fn order_keys() -> Vec<String> {
    let mut keys = vec!["c1".to_string(), "c2".to_string(), "g1".to_string()];
    keys.extend((1..=9).map(|i| format!("p{i}")));
    keys.push("u1".to_string());
    keys
}

/// `orders` table with regions `[-inf,f) [f,m) [m,t) [t,+inf)` owned by two
/// servers, one row per key of [`order_keys`].
pub fn orders_store() -> MemoryStore {
    let store = MemoryStore::new();
    let splits = ["f", "m", "t"]
        .iter()
        .map(|key| key.as_bytes().to_vec())
        .collect::<Vec<_>>();
    let owners = vec!["rs1:16020".to_string(), "rs2:16020".to_string()];
    store
        .create_table(ORDERS, regions_from_splits(&splits, &owners).expect("regions"))
        .expect("create table");
    store
        .load_rows(
            ORDERS,
            order_keys()
                .into_iter()
                .enumerate()
                .map(|(i, key)| order_row(&key, &format!("customer-{i}"), i as i64 * 100)),
        )
        .expect("load rows");
    store
}

pub fn order_row(key: &str, customer: &str, total_cents: i64) -> RawRow {
    RawRow::new(
        key,
        vec![
            Cell::new("d", "customer", 1, customer),
            Cell::new("d", "total", 1, total_cents.to_be_bytes().to_vec()),
            Cell::new("meta", "source", 1, "import"),
        ],
    )
}

pub fn order_codec() -> ColumnMappingCodec {
    ColumnMappingCodec::new(vec![
        ColumnMapping::required("customer", "d", "customer", ValueKind::Utf8),
        ColumnMapping::required("total_cents", "d", "total", ValueKind::Int64),
    ])
}

pub fn pool(store: &MemoryStore, max_connections: usize) -> Arc<ConnectionPool> {
    ConnectionPool::new(
        Arc::new(store.clone()),
        PoolOptions {
            max_connections_per_key: max_connections,
            acquire_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(1),
        },
    )
}

pub fn connection() -> ConnectionConfig {
    ConnectionConfig::new("memory://orders").with_principal("reader", "secret")
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: true,
    }
}
