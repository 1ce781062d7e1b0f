//! # Range Data Model
//!
//! A [`Range`] is a pre-provisioned, half-open interval of ticket values
//! `[start, end)` together with a cursor. The cursor (`current`) is the number
//! of tickets already issued from the range, so the next ticket is always
//! `start + current` and the remaining capacity is `end - (start + current)`.
//!
//! Ranges are created by an external provisioning process, mutated only by
//! claim transactions, and never deleted. Once the cursor reaches the upper
//! bound the range becomes [`RangeStatus::Exhausted`] and is no longer
//! eligible for selection.
//!
//! All arithmetic is done in `i64` to match the backing `BIGINT` columns.

use chrono::{DateTime, Utc};
use core::fmt;
use core::str::FromStr;

/// Identifier of a [`Range`] row.
///
/// Returned alongside every claim so callers can attribute issued tickets to
/// the range they were drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RangeId(pub i64);

impl RangeId {
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for RangeId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a [`Range`].
///
/// The only legal transition is `Active -> Exhausted`, and it happens at most
/// once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeStatus {
    Active,
    Exhausted,
}

impl RangeStatus {
    /// Textual encoding used by the `status` column.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for RangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a stored status string is not one of the known states.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown range status: {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for RangeStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "exhausted" => Ok(Self::Exhausted),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A contiguous interval of ticket values with an issuance cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub id: RangeId,
    /// Inclusive lower bound. Immutable after creation.
    pub start: i64,
    /// Exclusive upper bound. Immutable after creation.
    pub end: i64,
    /// Tickets already issued from this range.
    pub current: i64,
    pub status: RangeStatus,
    pub updated_at: DateTime<Utc>,
}

impl Range {
    /// Total number of tickets the range can ever issue.
    pub const fn size(&self) -> i64 {
        self.end - self.start
    }

    /// Tickets still available in this range.
    pub const fn remaining(&self) -> i64 {
        self.end - (self.start + self.current)
    }

    /// The value the next claim against this range would receive.
    pub const fn next_ticket(&self) -> i64 {
        self.start + self.current
    }

    pub fn is_active(&self) -> bool {
        self.status == RangeStatus::Active
    }

    pub fn is_exhausted(&self) -> bool {
        self.status == RangeStatus::Exhausted
    }

    /// Returns `true` if the range is active and can satisfy a claim for
    /// `required` tickets without being split.
    pub fn has_capacity(&self, required: i64) -> bool {
        self.is_active() && required > 0 && self.remaining() >= required
    }

    /// Checks the structural invariants of a stored row:
    /// `start <= end` and `0 <= current <= end - start`, and an active range
    /// must not already be drained.
    pub fn is_consistent(&self) -> bool {
        self.start <= self.end
            && self.current >= 0
            && self.current <= self.size()
            && (self.is_exhausted() || self.remaining() > 0)
    }

    /// Returns the row as it looks after issuing `delta` tickets at `now`.
    ///
    /// The status flips to [`RangeStatus::Exhausted`] when the cursor reaches
    /// the upper bound. Returns `None` if `delta` is not positive, overflows,
    /// or does not fit in the remaining capacity.
    pub fn advanced(&self, delta: i64, now: DateTime<Utc>) -> Option<Range> {
        if delta <= 0 || !self.has_capacity(delta) {
            return None;
        }
        let current = self.current.checked_add(delta)?;
        let status = if self.start + current >= self.end {
            RangeStatus::Exhausted
        } else {
            self.status
        };
        Some(Range {
            current,
            status,
            updated_at: now,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: i64, end: i64, current: i64) -> Range {
        Range {
            id: RangeId(1),
            start,
            end,
            current,
            status: RangeStatus::Active,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn cursor_is_an_offset_from_start() {
        let r = range(1000, 1003, 0);
        assert_eq!(r.next_ticket(), 1000);
        assert_eq!(r.remaining(), 3);
        assert_eq!(r.size(), 3);
    }

    #[test]
    fn advancing_to_the_end_exhausts() {
        let now = Utc::now();
        let r = range(1000, 1003, 0);
        let r = r.advanced(2, now).unwrap();
        assert_eq!(r.current, 2);
        assert!(r.is_active());
        let r = r.advanced(1, now).unwrap();
        assert_eq!(r.current, 3);
        assert!(r.is_exhausted());
        assert!(r.is_consistent());
        assert!(r.advanced(1, now).is_none());
    }

    #[test]
    fn capacity_requires_whole_claim() {
        let r = range(0, 100, 98);
        assert!(r.has_capacity(1));
        assert!(r.has_capacity(2));
        assert!(!r.has_capacity(5));
        assert!(!r.has_capacity(0));
        assert!(r.advanced(5, Utc::now()).is_none());
    }

    #[test]
    fn exhausted_range_has_no_capacity() {
        let mut r = range(0, 10, 3);
        r.status = RangeStatus::Exhausted;
        assert!(!r.has_capacity(1));
        assert!(r.advanced(1, Utc::now()).is_none());
    }

    #[test]
    fn inconsistent_rows_are_detected() {
        assert!(!range(10, 5, 0).is_consistent());
        assert!(!range(0, 10, 11).is_consistent());
        assert!(!range(0, 10, -1).is_consistent());
        // drained but still marked active
        assert!(!range(0, 10, 10).is_consistent());
    }

    #[test]
    fn status_round_trips_through_text() {
        assert_eq!("active".parse::<RangeStatus>(), Ok(RangeStatus::Active));
        assert_eq!(
            RangeStatus::Exhausted.as_str().parse::<RangeStatus>(),
            Ok(RangeStatus::Exhausted)
        );
        assert!("retired".parse::<RangeStatus>().is_err());
    }
}
