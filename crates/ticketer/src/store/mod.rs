//! # Range Store
//!
//! The store is the single source of truth for allocation state. The engine
//! never caches a range's cursor; every read and write of `current` happens
//! inside a [`RangeTxn`] that holds the row lock.
//!
//! A store exposes two primitives inside a transaction:
//!
//! - [`RangeTxn::select_eligible_range`] returns one active range with room
//!   for `required` tickets and locks it for the rest of the transaction.
//!   Rows already locked by other claims are skipped, which steers concurrent
//!   callers toward different ranges.
//! - [`RangeTxn::advance_range`] moves the cursor of the locked row forward
//!   and flips it to exhausted when it reaches the upper bound.
//!
//! Dropping a transaction without calling [`RangeTxn::commit`] discards all
//! of its writes and releases its connection.
//!
//! ## Backends
//!
//! - [`MemoryRangeStore`] - process-local, for tests, benches and local runs.
//! - [`PostgresRangeStore`] - durable, pooled, `FOR UPDATE SKIP LOCKED`
//!   (feature `postgres`).

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::*;
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
#[cfg(feature = "postgres")]
pub use postgres::*;

use crate::{Error, Range, RangeId, Result};
use core::fmt;
use core::future::Future;
use core::str::FromStr;

/// A transactional store of [`Range`] rows.
pub trait RangeStore: Send + Sync {
    type Txn: RangeTxn;

    /// Acquires a connection and opens a transaction on it.
    fn begin(&self) -> impl Future<Output = Result<Self::Txn>> + Send;
}

/// An open transaction against a [`RangeStore`].
///
/// At most one range is locked per transaction.
pub trait RangeTxn: Send {
    /// Selects and locks one active range with at least `required` tickets
    /// of remaining capacity. Returns `None` when no such range is available.
    fn select_eligible_range(
        &mut self,
        required: i64,
    ) -> impl Future<Output = Result<Option<Range>>> + Send;

    /// Advances the cursor of the range locked by this transaction by
    /// `delta` and returns the post-update row.
    fn advance_range(
        &mut self,
        id: RangeId,
        delta: i64,
    ) -> impl Future<Output = Result<Range>> + Send;

    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    fn rollback(self) -> impl Future<Output = Result<()>> + Send;
}

/// What `select_eligible_range` does when every eligible row is locked by
/// another in-flight claim.
///
/// With several active ranges the skip-locked probe almost always finds a free
/// row. With a single active range, `Skip` reports "no eligible range" under
/// contention even though capacity exists, while `Wait` queues behind the
/// lock holder and re-checks capacity once the lock is granted. When several
/// eligible rows are all locked, both policies return none immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ContentionPolicy {
    /// Only ever skip locked rows.
    Skip,
    /// Skip locked rows first, then block if exactly one eligible row exists.
    #[default]
    Wait,
}

impl ContentionPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Wait => "wait",
        }
    }
}

impl fmt::Display for ContentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentionPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "wait" => Ok(Self::Wait),
            other => Err(Error::invalid(format!(
                "unknown contention policy {other:?} (expected `skip` or `wait`)"
            ))),
        }
    }
}

/// Validates bounds for a range about to be provisioned.
pub(crate) fn check_bounds(start: i64, end: i64, current: i64) -> Result<()> {
    if start >= end {
        return Err(Error::invalid(format!(
            "range start ({start}) must be below end ({end})"
        )));
    }
    let size = end
        .checked_sub(start)
        .ok_or_else(|| Error::invalid("range size overflows i64"))?;
    if !(0..=size).contains(&current) {
        return Err(Error::invalid(format!(
            "range cursor ({current}) must be within 0..={size}"
        )));
    }
    Ok(())
}
