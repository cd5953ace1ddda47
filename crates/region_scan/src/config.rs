//! Connection, retry, and pool configuration.
//!
//! Everything here is an immutable input: a scan never observes configuration
//! changes after its reader is opened.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;

use crate::spec::{ColumnSelector, ScanTemplate, DEFAULT_BATCH_SIZE, DEFAULT_CACHE_SIZE};

const DEFAULT_ENDPOINT: &str = "memory://default";
const DEFAULT_RETRY_LIMIT: usize = 5;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 60;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 2_000;
const DEFAULT_POOL_MAX_CONNECTIONS: usize = 8;
const DEFAULT_POOL_ACQUIRE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_POOL_DRAIN_TIMEOUT_MS: u64 = 10_000;

/// Store connection identity. Equal configurations share pooled sessions.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionConfig {
    /// Store endpoint, e.g. a quorum address or `memory://name`.
    pub endpoint: String,
    /// Authenticated principal, if the store requires one.
    pub principal: Option<String>,
    /// Opaque credentials for `principal`.
    pub credentials: Option<String>,
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            principal: None,
            credentials: None,
        }
    }

    pub fn with_principal(
        mut self,
        principal: impl Into<String>,
        credentials: impl Into<String>,
    ) -> Self {
        self.principal = Some(principal.into());
        self.credentials = Some(credentials.into());
        self
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint)
            .field("principal", &self.principal)
            .field(
                "credentials",
                &self.credentials.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Bounded exponential backoff for transient scan failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed per failure streak; a successful fetch resets the count.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Adds up to 50% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_LIMIT,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = 1u32 << attempt.saturating_sub(1).min(16) as u32;
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = (delay.as_millis() / 2) as u64;
        let extra = rand::thread_rng().gen_range(0..=half);
        delay.saturating_add(Duration::from_millis(extra))
    }
}

/// Sizing and timeouts for the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Maximum concurrently borrowed sessions per connection configuration.
    pub max_connections_per_key: usize,
    /// Longest time `acquire` waits for a free slot.
    pub acquire_timeout: Duration,
    /// Longest time `shutdown` waits for borrowed sessions to come back.
    pub drain_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections_per_key: DEFAULT_POOL_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_millis(DEFAULT_POOL_ACQUIRE_TIMEOUT_MS),
            drain_timeout: Duration::from_millis(DEFAULT_POOL_DRAIN_TIMEOUT_MS),
        }
    }
}

/// Complete scan configuration for one process.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub connection: ConnectionConfig,
    pub template: ScanTemplate,
    pub retry: RetryPolicy,
    pub pool: PoolOptions,
}

impl ScanConfig {
    /// Loads configuration from `REGION_SCAN_*` environment variables with defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`ScanConfig::from_env`] but reads variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let endpoint =
            lookup("REGION_SCAN_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let principal = lookup("REGION_SCAN_PRINCIPAL").filter(|value| !value.is_empty());
        let credentials = lookup("REGION_SCAN_CREDENTIALS").filter(|value| !value.is_empty());
        if credentials.is_some() && principal.is_none() {
            anyhow::bail!("REGION_SCAN_CREDENTIALS requires REGION_SCAN_PRINCIPAL");
        }

        let cache_size = parse_usize(lookup("REGION_SCAN_CACHE_SIZE"), DEFAULT_CACHE_SIZE)?.max(1);
        let batch_size = parse_usize(lookup("REGION_SCAN_BATCH_SIZE"), DEFAULT_BATCH_SIZE)?.max(1);
        let column_filters = match lookup("REGION_SCAN_COLUMNS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| {
                    part.parse::<ColumnSelector>()
                        .with_context(|| format!("invalid REGION_SCAN_COLUMNS entry: {part}"))
                })
                .collect::<Result<_>>()?,
            None => Default::default(),
        };

        let retry = RetryPolicy {
            max_attempts: parse_usize(lookup("REGION_SCAN_RETRY_LIMIT"), DEFAULT_RETRY_LIMIT)?,
            base_delay: Duration::from_millis(parse_u64(
                lookup("REGION_SCAN_RETRY_BASE_DELAY_MS"),
                DEFAULT_RETRY_BASE_DELAY_MS,
            )?),
            max_delay: Duration::from_millis(parse_u64(
                lookup("REGION_SCAN_RETRY_MAX_DELAY_MS"),
                DEFAULT_RETRY_MAX_DELAY_MS,
            )?),
            jitter: true,
        };

        let pool = PoolOptions {
            max_connections_per_key: parse_usize(
                lookup("REGION_SCAN_POOL_MAX_CONNECTIONS"),
                DEFAULT_POOL_MAX_CONNECTIONS,
            )?
            .max(1),
            acquire_timeout: Duration::from_millis(parse_u64(
                lookup("REGION_SCAN_POOL_ACQUIRE_TIMEOUT_MS"),
                DEFAULT_POOL_ACQUIRE_TIMEOUT_MS,
            )?),
            drain_timeout: Duration::from_millis(parse_u64(
                lookup("REGION_SCAN_POOL_DRAIN_TIMEOUT_MS"),
                DEFAULT_POOL_DRAIN_TIMEOUT_MS,
            )?),
        };

        Ok(Self {
            connection: ConnectionConfig {
                endpoint,
                principal,
                credentials,
            },
            template: ScanTemplate {
                column_filters,
                batch_size,
                cache_size,
            },
            retry,
            pool,
        })
    }
}

/// Parses an optional `usize` with fallback default.
fn parse_usize(value: Option<String>, default_value: usize) -> Result<usize> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid usize value: {raw}")),
        None => Ok(default_value),
    }
}

/// Parses an optional `u64` with fallback default.
fn parse_u64(value: Option<String>, default_value: u64) -> Result<u64> {
    match value {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid u64 value: {raw}")),
        None => Ok(default_value),
    }
}
