use super::{TicketBatch, check_advance};
use crate::{Error, RangeTxn, Result};

/// Claims a contiguous block of `count` tickets from one active range.
///
/// A range qualifies only if it can hold the whole block; batches are never
/// split. This can report exhaustion while single claims would still
/// succeed.
#[tracing::instrument(level = "trace", skip(txn))]
pub async fn claim_batch<T: RangeTxn>(txn: &mut T, count: i64) -> Result<Option<TicketBatch>> {
    if count <= 0 {
        return Err(Error::invalid(format!(
            "batch count must be positive, got {count}"
        )));
    }
    let Some(before) = txn.select_eligible_range(count).await? else {
        return Ok(None);
    };
    let after = txn.advance_range(before.id, count).await?;
    check_advance(&before, &after, count)?;

    let end = after.start + after.current - 1;
    let start = end - (count - 1);
    debug_assert_eq!(start, before.next_ticket());

    Ok(Some(TicketBatch {
        start,
        end,
        range_id: after.id,
    }))
}
