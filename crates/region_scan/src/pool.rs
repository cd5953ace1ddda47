//! Process-wide pool of store sessions.
//!
//! Sessions are grouped by [`ConnectionConfig`]: identical configurations share
//! one sub-pool, distinct configurations never see each other's sessions. Each
//! sub-pool bounds concurrent borrows with a FIFO-fair semaphore, so waiters
//! are served in arrival order and an acquisition fails with
//! `ConnectionUnavailable` once its wait exceeds `acquire_timeout`.
//!
//! A borrowed session comes back either through `release`/drop (parked as idle
//! for reuse) or through `discard` (closed, so the next borrower reconnects).
//! Sessions returned after shutdown has drained their sub-pool are closed
//! instead of parked.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, PoolOptions};
use crate::error::{Result, ScanContext, ScanError};
use crate::metrics::ScanMetrics;
use crate::store::{StoreConnector, StoreSession};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static SHARED_POOL: OnceLock<Mutex<Option<Arc<ConnectionPool>>>> = OnceLock::new();

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Distinct connection configurations seen.
    pub keys: usize,
    /// Sessions parked for reuse.
    pub idle: usize,
    /// Sessions currently borrowed.
    pub outstanding: usize,
}

/// Outcome of [`ConnectionPool::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Parked sessions closed during teardown, including those returned while
    /// the pool was draining.
    pub closed_idle: usize,
    /// Borrowed sessions that were not returned within the drain timeout.
    pub abandoned: usize,
}

/// Sessions shared by every reader in the process, grouped per
/// [`ConnectionConfig`].
pub struct ConnectionPool {
    connector: Arc<dyn StoreConnector>,
    options: PoolOptions,
    pools: Mutex<HashMap<ConnectionConfig, Arc<KeyedPool>>>,
    closed: AtomicBool,
    metrics: Arc<ScanMetrics>,
}

struct KeyedPool {
    endpoint: String,
    slots: Arc<Semaphore>,
    idle: Mutex<IdleSessions>,
    outstanding: AtomicUsize,
    returned: Notify,
    closed: AtomicBool,
}

struct IdleSession {
    id: u64,
    session: Arc<dyn StoreSession>,
}

#[derive(Default)]
struct IdleSessions {
    sessions: Vec<IdleSession>,
    /// Set once shutdown has taken the parked sessions; nothing parks after.
    drained: bool,
}

impl KeyedPool {
    fn new(endpoint: String, capacity: usize) -> Self {
        Self {
            endpoint,
            slots: Arc::new(Semaphore::new(capacity.max(1))),
            idle: Mutex::new(IdleSessions::default()),
            outstanding: AtomicUsize::new(0),
            returned: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn take_idle(&self) -> Option<IdleSession> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .pop()
    }

    /// Parks a returned session. Hands it back when shutdown already drained
    /// the sub-pool, so the caller can close it.
    fn park(&self, idle: IdleSession) -> Option<IdleSession> {
        let mut parked = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if parked.drained {
            return Some(idle);
        }
        parked.sessions.push(idle);
        None
    }

    fn drain_idle(&self) -> Vec<IdleSession> {
        let mut parked = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        parked.drained = true;
        std::mem::take(&mut parked.sessions)
    }

    fn idle_len(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .len()
    }
}

impl ConnectionPool {
    /// Creates an independent pool with its own metrics.
    pub fn new(connector: Arc<dyn StoreConnector>, options: PoolOptions) -> Arc<Self> {
        Self::with_metrics(connector, options, Arc::new(ScanMetrics::default()))
    }

    /// Creates a pool that records into `metrics`.
    pub fn with_metrics(
        connector: Arc<dyn StoreConnector>,
        options: PoolOptions,
        metrics: Arc<ScanMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            options,
            pools: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    /// Returns the process-wide pool, creating it on first use.
    ///
    /// Once created, later calls return the same pool and ignore their
    /// arguments until [`ConnectionPool::shutdown_shared`] tears it down.
    pub fn shared(connector: Arc<dyn StoreConnector>, options: PoolOptions) -> Arc<Self> {
        let slot = SHARED_POOL.get_or_init(|| Mutex::new(None));
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = guard.as_ref().filter(|pool| !pool.is_shut_down()) {
            return pool.clone();
        }
        let pool = Self::new(connector, options);
        *guard = Some(pool.clone());
        pool
    }

    /// Tears down the process-wide pool if one exists.
    pub async fn shutdown_shared() -> Option<ShutdownReport> {
        let pool = SHARED_POOL
            .get()
            .and_then(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).take())?;
        Some(pool.shutdown().await)
    }

    /// Metrics shared by this pool and every reader borrowing from it.
    pub fn metrics(&self) -> &Arc<ScanMetrics> {
        &self.metrics
    }

    pub fn options(&self) -> PoolOptions {
        self.options
    }

    /// Returns `true` once [`ConnectionPool::shutdown`] has started.
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Occupancy summed over every sub-pool.
    pub fn stats(&self) -> PoolStats {
        let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools.values().fold(
            PoolStats {
                keys: pools.len(),
                ..PoolStats::default()
            },
            |mut stats, keyed| {
                stats.idle += keyed.idle_len();
                stats.outstanding += keyed.outstanding.load(Ordering::SeqCst);
                stats
            },
        )
    }

    /// Sub-pool for `config`, or `None` once shutdown has started. The check
    /// and the insert happen under the same lock that shutdown drains.
    fn keyed(&self, config: &ConnectionConfig) -> Option<Arc<KeyedPool>> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_shut_down() {
            return None;
        }
        let keyed = pools.entry(config.clone()).or_insert_with(|| {
            Arc::new(KeyedPool::new(
                config.endpoint.clone(),
                self.options.max_connections_per_key,
            ))
        });
        Some(keyed.clone())
    }

    /// Borrows a session for `config`, waiting at most `acquire_timeout` for a
    /// free slot.
    pub async fn acquire(&self, config: &ConnectionConfig) -> Result<PooledConnection> {
        let started = Instant::now();
        let unavailable = |reason: String| ScanError::ConnectionUnavailable {
            endpoint: config.endpoint.clone(),
            waited: started.elapsed(),
            reason,
            context: ScanContext::default(),
        };

        let Some(keyed) = self.keyed(config) else {
            self.metrics.record_pool_timeout();
            return Err(unavailable("connection pool is shut down".to_string()));
        };
        let permit = match tokio::time::timeout(
            self.options.acquire_timeout,
            keyed.slots.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                self.metrics.record_pool_timeout();
                return Err(unavailable("connection pool is shut down".to_string()));
            }
            Err(_) => {
                self.metrics.record_pool_timeout();
                warn!(
                    endpoint = %config.endpoint,
                    capacity = self.options.max_connections_per_key,
                    "timed out waiting for a pooled connection"
                );
                return Err(unavailable(format!(
                    "all {} connections in use",
                    self.options.max_connections_per_key
                )));
            }
        };
        self.metrics.record_pool_wait(started.elapsed());

        if keyed.closed.load(Ordering::SeqCst) {
            self.metrics.record_pool_timeout();
            return Err(unavailable("connection pool is shut down".to_string()));
        }

        // From here on the borrow guard keeps `outstanding` balanced, even if
        // this future is dropped while connecting.
        keyed.outstanding.fetch_add(1, Ordering::SeqCst);
        let borrow = Borrow {
            pool: keyed.clone(),
            _permit: permit,
        };

        let (id, session) = match keyed.take_idle() {
            Some(idle) => {
                self.metrics.record_connection_reused();
                (idle.id, idle.session)
            }
            None => match self.connector.connect(config).await {
                Ok(session) => {
                    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                    self.metrics.record_connection_opened();
                    debug!(endpoint = %config.endpoint, connection = id, "opened store connection");
                    (id, session)
                }
                Err(source) => {
                    warn!(endpoint = %config.endpoint, error = %source, "store connection failed");
                    return Err(ScanError::ConnectFailed {
                        endpoint: config.endpoint.clone(),
                        source,
                    });
                }
            },
        };

        Ok(PooledConnection {
            id,
            session,
            discarded: false,
            metrics: self.metrics.clone(),
            borrow,
        })
    }

    /// Returns a borrowed session for reuse.
    pub fn release(&self, connection: PooledConnection) {
        drop(connection);
    }

    /// Refuses new acquisitions, waits up to `drain_timeout` for borrowed
    /// sessions to come back, then closes every idle session.
    /// Sessions handed back after that are closed as they return.
    pub async fn shutdown(&self) -> ShutdownReport {
        let pools = {
            let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::SeqCst);
            pools.drain().map(|(_, keyed)| keyed).collect::<Vec<_>>()
        };
        let deadline = tokio::time::Instant::now() + self.options.drain_timeout;

        let mut report = ShutdownReport::default();
        for keyed in pools {
            keyed.closed.store(true, Ordering::SeqCst);
            loop {
                let notified = keyed.returned.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let outstanding = keyed.outstanding.load(Ordering::SeqCst);
                if outstanding == 0 {
                    break;
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    warn!(
                        endpoint = %keyed.endpoint,
                        outstanding,
                        "drain timeout elapsed with borrowed connections"
                    );
                    report.abandoned += outstanding;
                    break;
                }
            }
            keyed.slots.close();
            for idle in keyed.drain_idle() {
                idle.session.close().await;
                report.closed_idle += 1;
            }
        }

        info!(
            closed_idle = report.closed_idle,
            abandoned = report.abandoned,
            "connection pool shut down"
        );
        report
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("options", &self.options)
            .field("stats", &self.stats())
            .field("closed", &self.is_shut_down())
            .finish()
    }
}

/// Slot accounting for one borrow; released last, after the session is parked.
struct Borrow {
    pool: Arc<KeyedPool>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Borrow {
    fn drop(&mut self) {
        self.pool.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.pool.returned.notify_waiters();
    }
}

/// A session borrowed from the pool. Dropping it returns the session.
pub struct PooledConnection {
    id: u64,
    session: Arc<dyn StoreSession>,
    discarded: bool,
    metrics: Arc<ScanMetrics>,
    // Must stay the last field so the slot frees after the session is parked.
    borrow: Borrow,
}

impl PooledConnection {
    /// Pool-unique identifier of the underlying session.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The borrowed session.
    pub fn session(&self) -> &Arc<dyn StoreSession> {
        &self.session
    }

    /// Closes the session instead of returning it, so the next borrower
    /// reconnects. Used after transport failures.
    pub async fn discard(mut self) {
        self.discarded = true;
        self.session.close().await;
        self.metrics.record_connection_discarded();
        debug!(
            endpoint = %self.borrow.pool.endpoint,
            connection = self.id,
            "discarded store connection"
        );
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.discarded {
            return;
        }
        let Some(late) = self.borrow.pool.park(IdleSession {
            id: self.id,
            session: self.session.clone(),
        }) else {
            return;
        };
        let endpoint = &self.borrow.pool.endpoint;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(%endpoint, connection = late.id, "closing session returned after shutdown");
                runtime.spawn(async move { late.session.close().await });
            }
            Err(_) => warn!(
                %endpoint,
                connection = late.id,
                "session returned after shutdown outside a runtime; left unclosed"
            ),
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("endpoint", &self.borrow.pool.endpoint)
            .field("discarded", &self.discarded)
            .finish()
    }
}
