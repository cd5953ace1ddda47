//! Error taxonomy for partition planning, scanning, and row decoding.
//!
//! Store implementations report [`StoreError`], codecs report [`DecodeError`],
//! and everything surfaced to consumers is a [`ScanError`] carrying enough
//! context (table, key range, last delivered row) to resume or diagnose.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result alias used by the consumer-facing API.
pub type Result<T, E = ScanError> = std::result::Result<T, E>;

/// Table and key-range context attached to scan failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanContext {
    /// Table being scanned.
    pub table: String,
    /// Inclusive start key (empty means unbounded).
    pub start_key: Vec<u8>,
    /// Exclusive stop key (empty means unbounded).
    pub stop_key: Vec<u8>,
    /// Last row key successfully handed to the caller, if any.
    pub last_row_key: Option<Vec<u8>>,
}

impl fmt::Display for ScanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "table={} start={} stop={} last_row={}",
            self.table,
            hex::encode(&self.start_key),
            hex::encode(&self.stop_key),
            self.last_row_key
                .as_deref()
                .map(hex::encode)
                .unwrap_or_else(|| "none".to_string())
        )
    }
}

/// Errors surfaced by planners, readers, and the connection pool.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The table identifier does not resolve. Never retried.
    #[error("table '{table}' not found")]
    TableNotFound { table: String },

    /// The pool could not hand out a connection within its bound, or it has
    /// been shut down.
    #[error("no connection available for {endpoint} after {waited:?} ({context}): {reason}")]
    ConnectionUnavailable {
        endpoint: String,
        waited: Duration,
        reason: String,
        context: ScanContext,
    },

    /// Opening a new session failed. Readers fold transient causes into
    /// their own retry loop.
    #[error("connecting to {endpoint} failed: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: StoreError,
    },

    /// Streaming stopped and could not be resumed in place; the caller must
    /// restart the partition after `context.last_row_key`.
    #[error("scan interrupted ({context}): {reason}")]
    ScanInterrupted { context: ScanContext, reason: String },

    /// A row could not be decoded under the abort policy.
    #[error("decode failed ({context}): {source}")]
    Decode {
        context: ScanContext,
        #[source]
        source: DecodeError,
    },

    /// The caller's cancellation token fired or its deadline elapsed.
    #[error("scan cancelled ({context})")]
    Cancelled { context: ScanContext },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid reader state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    /// Any other store failure, passed through unmodified.
    #[error("store error ({context}): {source}")]
    Store {
        context: ScanContext,
        #[source]
        source: StoreError,
    },
}

impl ScanError {
    /// Wraps a store error, promoting table-not-found to its dedicated variant.
    pub fn from_store(context: ScanContext, source: StoreError) -> Self {
        match source {
            StoreError::TableNotFound(table) => Self::TableNotFound { table },
            source => Self::Store { context, source },
        }
    }

    /// Scan context for variants that carry one.
    pub fn context(&self) -> Option<&ScanContext> {
        match self {
            Self::ConnectionUnavailable { context, .. }
            | Self::ScanInterrupted { context, .. }
            | Self::Decode { context, .. }
            | Self::Cancelled { context }
            | Self::Store { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Fills in the scan context of errors raised outside a scan, such as
    /// pool failures.
    pub fn with_context(self, context: ScanContext) -> Self {
        match self {
            Self::ConnectionUnavailable {
                endpoint,
                waited,
                reason,
                ..
            } => Self::ConnectionUnavailable {
                endpoint,
                waited,
                reason,
                context,
            },
            Self::ConnectFailed { source, .. } => Self::from_store(context, source),
            err => err,
        }
    }

    /// Last row key delivered before the failure, when known.
    pub fn last_row_key(&self) -> Option<&[u8]> {
        self.context()
            .and_then(|context| context.last_row_key.as_deref())
    }

    /// Returns `true` for failures an orchestration layer may retry by
    /// rescheduling the partition.
    pub fn is_retryable_by_caller(&self) -> bool {
        match self {
            Self::ConnectionUnavailable { .. } | Self::ScanInterrupted { .. } => true,
            Self::ConnectFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, Self::Store { source, .. } if source.is_transient())
    }
}

/// Errors reported by store sessions and scanners.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("table '{0}' not found")]
    TableNotFound(String),

    /// Network or server hiccup; the operation may succeed if repeated.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("invalid region metadata for table '{table}': {reason}")]
    InvalidMetadata { table: String, reason: String },

    #[error("store failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Per-row decoding failures produced by a `RowCodec`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("row {row_key}: required column {column} is missing")]
    MissingColumn { row_key: String, column: String },

    #[error("row {row_key}: column {column} is not a valid {expected}: {reason}")]
    InvalidValue {
        row_key: String,
        column: String,
        expected: &'static str,
        reason: String,
    },

    #[error("row {row_key}: {message}")]
    Custom { row_key: String, message: String },
}

impl DecodeError {
    pub fn missing_column(row_key: &[u8], column: impl Into<String>) -> Self {
        Self::MissingColumn {
            row_key: hex::encode(row_key),
            column: column.into(),
        }
    }

    pub fn invalid_value(
        row_key: &[u8],
        column: impl Into<String>,
        expected: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            row_key: hex::encode(row_key),
            column: column.into(),
            expected,
            reason: reason.into(),
        }
    }

    pub fn custom(row_key: &[u8], message: impl Into<String>) -> Self {
        Self::Custom {
            row_key: hex::encode(row_key),
            message: message.into(),
        }
    }
}
