//! Claim algorithms.
//!
//! Both algorithms run entirely inside a caller-supplied [`RangeTxn`] and
//! never commit or roll back themselves; that is the job of the
//! [`Allocator`](crate::Allocator). Each returns `None` when no range can
//! satisfy the claim.

pub mod batch;
pub mod single;

pub use batch::claim_batch;
pub use single::claim_one;

use crate::{Error, Range, RangeId, Result};
use core::ops::RangeInclusive;

/// A single issued ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub value: i64,
    pub range_id: RangeId,
}

/// A contiguous block of issued tickets, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TicketBatch {
    pub start: i64,
    pub end: i64,
    pub range_id: RangeId,
}

impl TicketBatch {
    /// Number of tickets in the block.
    pub const fn len(&self) -> i64 {
        self.end - self.start + 1
    }

    pub const fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, value: i64) -> bool {
        self.values().contains(&value)
    }

    /// Every ticket in the block, so callers can hand them out locally.
    pub fn values(&self) -> RangeInclusive<i64> {
        self.start..=self.end
    }
}

impl IntoIterator for TicketBatch {
    type Item = i64;
    type IntoIter = RangeInclusive<i64>;

    fn into_iter(self) -> Self::IntoIter {
        self.values()
    }
}

/// Confirms the store moved the cursor of the right row by exactly `delta`.
pub(crate) fn check_advance(before: &Range, after: &Range, delta: i64) -> Result<()> {
    if after.id != before.id || after.current != before.current + delta {
        return Err(Error::corrupt(
            "advance",
            format!(
                "range {} cursor moved {} -> {} for a claim of {delta}",
                before.id, before.current, after.current
            ),
        ));
    }
    if after.start + after.current > after.end {
        return Err(Error::corrupt(
            "advance",
            format!("range {} cursor passed its upper bound", after.id),
        ));
    }
    Ok(())
}
