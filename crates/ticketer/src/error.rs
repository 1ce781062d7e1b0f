//! Error types for ticket allocation.
//!
//! The central [`Error`] enum keeps the three outcomes a caller must be able
//! to tell apart:
//!
//! - `PoolExhausted`: no active range has room for the request. Expected and
//!   recoverable only by provisioning more ranges.
//! - `InvalidRequest`: the request was rejected before any transaction was
//!   opened.
//! - `Timeout` / `Store`: the claim transaction failed and was rolled back.
//!   Both report [`ErrorKind::TransactionFailure`].
//!
//! A returned ticket always means the claim committed; no variant carries a
//! partially issued value.

use core::time::Duration;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Boxed driver error carried by [`Error::Store`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for the allocation engine.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No eligible range has capacity for the requested number of tickets.
    #[error("no range has capacity for {requested} ticket(s)")]
    PoolExhausted { requested: i64 },

    /// The request was malformed or outside the configured bounds.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The claim did not complete in time and was rolled back.
    #[error("claim timed out after {after:?}")]
    Timeout { after: Duration },

    /// The backing store failed while running the claim.
    #[error("store error during {context}: {source}")]
    Store {
        context: &'static str,
        #[source]
        source: BoxError,
    },
}

/// Coarse classification of an [`Error`], used for reporting and transport
/// mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PoolExhausted,
    InvalidRequest,
    TransactionFailure,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PoolExhausted => "pool_exhausted",
            Self::InvalidRequest => "invalid_request",
            Self::TransactionFailure => "transaction_failure",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::Timeout { .. } | Self::Store { .. } => ErrorKind::TransactionFailure,
        }
    }

    /// Transaction failures may succeed on retry. Exhaustion and invalid
    /// requests never will.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransactionFailure
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn store(context: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Store {
            context,
            source: source.into(),
        }
    }

    /// Store error for a broken invariant detected in the data itself.
    pub fn corrupt(context: &'static str, detail: impl Into<String>) -> Self {
        Self::store(context, detail.into())
    }
}

#[cfg(feature = "postgres")]
impl Error {
    /// Adapter for `map_err` on sqlx calls.
    pub(crate) fn sqlx(context: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |e| Self::store(context, e)
    }
}
