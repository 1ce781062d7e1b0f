use super::{Ticket, check_advance};
use crate::{RangeTxn, Result};

/// Claims exactly one ticket from one active range.
///
/// The ticket is `start + current` as read *before* the cursor moves. The
/// call that drains a range still returns a valid ticket; the range is
/// exhausted as part of the same update.
#[tracing::instrument(level = "trace", skip_all)]
pub async fn claim_one<T: RangeTxn>(txn: &mut T) -> Result<Option<Ticket>> {
    let Some(before) = txn.select_eligible_range(1).await? else {
        return Ok(None);
    };
    let after = txn.advance_range(before.id, 1).await?;
    check_advance(&before, &after, 1)?;

    Ok(Some(Ticket {
        value: before.next_ticket(),
        range_id: before.id,
    }))
}
